//! Events reported by agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AgentId, ResourceId};
use crate::update::LogStream;

/// A fragment of step output, numbered by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFragment {
    pub step: usize,
    /// Monotonic per-step sequence number, starting at 0.
    pub seq: u64,
    #[serde(default)]
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportKind {
    RunStarted,
    StepStarted {
        step: usize,
    },
    StepSucceeded {
        step: usize,
        #[serde(default)]
        exit_code: i32,
    },
    StepFailed {
        step: usize,
        exit_code: i32,
        #[serde(default)]
        message: Option<String>,
    },
    /// The agent finished with the run (after the last step or after a revoke).
    RunFinalized,
    RunFailed {
        message: String,
    },
    Log(LogFragment),
}

/// One report from an agent about the run it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: AgentId,
    pub run_id: ResourceId,
    pub event: ReportKind,
    /// Agent-side timestamp; the control plane's clock is used when absent.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_wire_format() {
        let json = serde_json::json!({
            "agent_id": "agent-1",
            "run_id": ResourceId::new(),
            "event": {"type": "step_failed", "step": 2, "exit_code": 1}
        });
        let report: AgentReport = serde_json::from_value(json).unwrap();
        assert_eq!(
            report.event,
            ReportKind::StepFailed {
                step: 2,
                exit_code: 1,
                message: None
            }
        );
        assert!(report.at.is_none());
    }

    #[test]
    fn test_log_fragment_defaults_to_stdout() {
        let json = serde_json::json!({"type": "log", "step": 0, "seq": 3, "content": "ok"});
        let kind: ReportKind = serde_json::from_value(json).unwrap();
        let ReportKind::Log(fragment) = kind else {
            panic!("expected log fragment");
        };
        assert_eq!(fragment.stream, LogStream::Stdout);
        assert_eq!(fragment.seq, 3);
    }
}
