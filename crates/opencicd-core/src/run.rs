//! Run and step execution types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::id::{AgentId, ResourceId};
use crate::job::{Job, StepCondition};
use crate::lifecycle::{RunState, StepState};

/// What triggered a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerKind {
    /// Push to a branch.
    Push,
    /// Started by hand from a UI or CLI.
    Manual,
    /// Started through the API.
    #[default]
    Api,
    /// Re-created after the agent running the original was lost.
    Retry { original_run_id: ResourceId },
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::Manual => "manual",
            TriggerKind::Api => "api",
            TriggerKind::Retry { .. } => "retry",
        }
    }
}

/// Trigger information.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub kind: TriggerKind,
    /// Who triggered the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Git information for a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Request to create a run of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub trigger: TriggerKind,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Overrides the job's priority tier.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Extra environment layered over the job's.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One instance of a step definition inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Declared position; defines execution order.
    pub index: usize,
    pub name: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<StepCondition>,
    pub state: StepState,
    pub exit_code: Option<i32>,
    /// Number of persisted log lines.
    pub log_lines: u64,
    /// Total bytes of persisted log content.
    pub log_bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One concrete execution of a job version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub job_version: u32,
    pub job_name: String,
    pub repository: String,
    pub state: RunState,
    pub agent: Option<AgentId>,
    pub trigger: TriggerInfo,
    pub git: GitInfo,
    pub requires: BTreeSet<String>,
    pub priority: i32,
    /// 1 for a fresh run, incremented on every retry.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ResourceId>,
    /// Why the run failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepExecution>,
    pub created_at: DateTime<Utc>,
    /// When the run (re)entered the pending queue; orders runs within a priority tier.
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token maintained by the store.
    #[serde(default)]
    pub version: u64,
}

impl Run {
    /// A PENDING run of `job` with every step materialized as QUEUED.
    pub fn new(job: &Job, request: RunRequest, now: DateTime<Utc>) -> Self {
        let mut env = job.env.clone();
        env.extend(request.env);

        let steps = job
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepExecution {
                index,
                name: step.name.clone(),
                command: step.command.clone(),
                env: step.env.clone(),
                when: step.when.clone(),
                state: StepState::Queued,
                exit_code: None,
                log_lines: 0,
                log_bytes: 0,
                started_at: None,
                finished_at: None,
            })
            .collect();

        Self {
            id: ResourceId::new(),
            job_id: job.id,
            job_version: job.version,
            job_name: job.name.clone(),
            repository: job.repository.clone(),
            state: RunState::Pending,
            agent: None,
            trigger: TriggerInfo {
                kind: request.trigger,
                actor: request.actor,
            },
            git: GitInfo {
                commit: request.commit,
                branch: request.branch,
            },
            requires: job.requires.clone(),
            priority: request.priority.unwrap_or(job.priority),
            attempt: 1,
            retry_of: None,
            reason: None,
            env,
            steps,
            created_at: now,
            queued_at: now,
            started_at: None,
            finished_at: None,
            version: 0,
        }
    }

    /// A fresh PENDING copy of this run for another attempt.
    pub fn retry(&self, now: DateTime<Utc>) -> Self {
        let steps = self
            .steps
            .iter()
            .map(|step| StepExecution {
                state: StepState::Queued,
                exit_code: None,
                log_lines: 0,
                log_bytes: 0,
                started_at: None,
                finished_at: None,
                ..step.clone()
            })
            .collect();

        Self {
            id: ResourceId::new(),
            state: RunState::Pending,
            agent: None,
            trigger: TriggerInfo {
                kind: TriggerKind::Retry {
                    original_run_id: self.id,
                },
                actor: self.trigger.actor.clone(),
            },
            attempt: self.attempt + 1,
            retry_of: Some(self.id),
            reason: None,
            steps,
            created_at: now,
            queued_at: now,
            started_at: None,
            finished_at: None,
            version: 0,
            ..self.clone()
        }
    }

    pub fn step(&self, index: usize) -> Option<&StepExecution> {
        self.steps.get(index)
    }

    /// First step that has not reached a terminal state.
    pub fn next_open_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.state.is_terminal())
    }

    /// True when every step ended SUCCESS or SKIPPED.
    pub fn all_steps_passed(&self) -> bool {
        self.steps.iter().all(|s| s.state.lets_successor_start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobDefinition, StepDefinition};

    fn job() -> Job {
        let steps = ["checkout", "test", "package"]
            .into_iter()
            .map(|name| StepDefinition {
                name: name.to_string(),
                command: format!("make {name}"),
                env: BTreeMap::new(),
                when: None,
            })
            .collect();
        Job::create(
            JobDefinition {
                name: "build".to_string(),
                repository: "https://example.com/app.git".to_string(),
                branches: vec![],
                requires: ["docker".to_string()].into(),
                priority: 5,
                env: [("CI".to_string(), "true".to_string())].into(),
                steps,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_run_materializes_queued_steps_in_order() {
        let run = Run::new(&job(), RunRequest::default(), Utc::now());
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.attempt, 1);
        assert_eq!(run.priority, 5);
        let names: Vec<_> = run.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["checkout", "test", "package"]);
        assert!(run.steps.iter().all(|s| s.state == StepState::Queued));
        assert!(run.steps.iter().enumerate().all(|(i, s)| s.index == i));
    }

    #[test]
    fn test_request_env_overrides_job_env() {
        let request = RunRequest {
            env: [("CI".to_string(), "false".to_string())].into(),
            priority: Some(9),
            ..Default::default()
        };
        let run = Run::new(&job(), request, Utc::now());
        assert_eq!(run.env.get("CI").map(String::as_str), Some("false"));
        assert_eq!(run.priority, 9);
    }

    #[test]
    fn test_retry_links_to_original_and_resets_steps() {
        let mut run = Run::new(&job(), RunRequest::default(), Utc::now());
        run.state = RunState::Failed;
        run.agent = Some(AgentId::from("agent-1"));
        run.steps[0].state = StepState::Success;
        run.steps[1].state = StepState::Failed;

        let retry = run.retry(Utc::now());
        assert_ne!(retry.id, run.id);
        assert_eq!(retry.retry_of, Some(run.id));
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.state, RunState::Pending);
        assert!(retry.agent.is_none());
        assert!(retry.steps.iter().all(|s| s.state == StepState::Queued));
        assert_eq!(
            retry.trigger.kind,
            TriggerKind::Retry {
                original_run_id: run.id
            }
        );
    }

    #[test]
    fn test_next_open_step_skips_terminal_steps() {
        let mut run = Run::new(&job(), RunRequest::default(), Utc::now());
        assert_eq!(run.next_open_step(), Some(0));
        run.steps[0].state = StepState::Success;
        run.steps[1].state = StepState::Skipped;
        assert_eq!(run.next_open_step(), Some(2));
        run.steps[2].state = StepState::Success;
        assert_eq!(run.next_open_step(), None);
        assert!(run.all_steps_passed());
    }
}
