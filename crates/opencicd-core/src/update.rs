//! Live updates published to subscribers of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{EntityRef, TransitionRecord};
use crate::id::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    #[default]
    Stdout,
    Stderr,
    System,
}

/// A persisted line of step output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub run_id: ResourceId,
    pub step: usize,
    /// Agent-supplied per-step sequence number.
    pub seq: u64,
    pub stream: LogStream,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Missing log sequence numbers that did not arrive within the gap window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGap {
    pub run_id: ResourceId,
    pub step: usize,
    /// First missing sequence number.
    pub from_seq: u64,
    /// Last missing sequence number (inclusive).
    pub to_seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// One item of the live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunUpdate {
    Transition(TransitionRecord),
    Log(LogLine),
    Gap(LogGap),
}

impl RunUpdate {
    /// The run this update concerns. Agent transitions that are not tied to a run
    /// (registration, heartbeat timeout while idle) return `None`.
    pub fn run_id(&self) -> Option<ResourceId> {
        match self {
            RunUpdate::Transition(record) => match &record.entity {
                EntityRef::Run { id } => Some(*id),
                EntityRef::Step { run, .. } => Some(*run),
                EntityRef::Agent { .. } => record.run_id,
            },
            RunUpdate::Log(line) => Some(line.run_id),
            RunUpdate::Gap(gap) => Some(gap.run_id),
        }
    }
}

/// Outbound "publish to subscribers of run Y" capability.
///
/// Publishing must never block: slow or absent subscribers lose updates and resync from
/// persisted history.
pub trait UpdatePublisher: Send + Sync {
    fn publish(&self, update: RunUpdate);
}

/// Publisher that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl UpdatePublisher for NoopPublisher {
    fn publish(&self, _update: RunUpdate) {}
}
