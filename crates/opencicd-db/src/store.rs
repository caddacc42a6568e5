//! Storage contract.
//!
//! Runs and agents are aggregates with an optimistic `version`. A [`Transaction`] carries every
//! write of one logical operation (both sides of an assignment, a step failure plus the run
//! failure it causes, the audit records for all of them) and commits all or nothing.

use async_trait::async_trait;
use opencicd_core::agent::Agent;
use opencicd_core::audit::{EntityRef, TransitionRecord};
use opencicd_core::job::Job;
use opencicd_core::lifecycle::RunState;
use opencicd_core::run::Run;
use opencicd_core::update::LogLine;
use opencicd_core::{AgentId, ResourceId};

use crate::DbResult;

/// One aggregate write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write<T> {
    /// Must not exist yet.
    Insert(T),
    /// `version` must equal the stored version; the store bumps it on commit.
    Update(T),
}

impl<T> Write<T> {
    pub fn value(&self) -> &T {
        match self {
            Write::Insert(v) | Write::Update(v) => v,
        }
    }
}

/// Writes committed atomically.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub runs: Vec<Write<Run>>,
    pub agents: Vec<Write<Agent>>,
    /// Records in the order they happened. `seq` and `position` are assigned on commit.
    pub audit: Vec<TransitionRecord>,
    /// Output released by a finishing run.
    pub logs: Vec<LogLine>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.agents.is_empty() && self.audit.is_empty() && self.logs.is_empty()
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub job_id: Option<ResourceId>,
    pub agent: Option<AgentId>,
}

impl RunFilter {
    pub fn pending() -> Self {
        Self {
            state: Some(RunState::Pending),
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.state.is_none_or(|s| s == run.state)
            && self.job_id.is_none_or(|id| id == run.job_id)
            && self
                .agent
                .as_ref()
                .is_none_or(|a| run.agent.as_ref() == Some(a))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> DbResult<()>;

    // Jobs

    /// Store version 1 of a new job.
    async fn insert_job(&self, job: Job) -> DbResult<Job>;

    /// Store the next version. Fails with `Conflict` unless `job.version` is exactly one
    /// past the latest stored version.
    async fn insert_job_version(&self, job: Job) -> DbResult<Job>;

    /// Set the tombstone on every version of a job.
    async fn mark_job_deleted(&self, id: ResourceId) -> DbResult<Job>;

    /// Latest version.
    async fn get_job(&self, id: ResourceId) -> DbResult<Job>;

    async fn get_job_version(&self, id: ResourceId, version: u32) -> DbResult<Job>;

    /// Latest version of every job, ordered by name.
    async fn list_jobs(&self, include_deleted: bool) -> DbResult<Vec<Job>>;

    // Runs and agents

    /// Run with its step log counters filled in.
    async fn get_run(&self, id: ResourceId) -> DbResult<Run>;

    /// Runs matching `filter`, oldest first.
    async fn list_runs(&self, filter: &RunFilter) -> DbResult<Vec<Run>>;

    async fn get_agent(&self, id: &AgentId) -> DbResult<Agent>;

    /// All agents ordered by identity.
    async fn list_agents(&self) -> DbResult<Vec<Agent>>;

    /// Apply every write or none. Returns the audit records as stored.
    async fn commit(&self, tx: Transaction) -> DbResult<Vec<TransitionRecord>>;

    // History

    /// Records of one entity in `seq` order.
    async fn history(&self, entity: &EntityRef) -> DbResult<Vec<TransitionRecord>>;

    /// Records of a run and all of its steps, in global order.
    async fn run_history(&self, run_id: ResourceId) -> DbResult<Vec<TransitionRecord>>;

    /// Global audit log from `after` (exclusive), at most `limit` records.
    async fn audit_log(&self, after: u64, limit: usize) -> DbResult<Vec<TransitionRecord>>;

    // Logs

    async fn append_logs(&self, lines: Vec<LogLine>) -> DbResult<()>;

    /// Persisted log lines of a run in arrival order, optionally for one step.
    async fn logs(
        &self,
        run_id: ResourceId,
        step: Option<usize>,
        offset: usize,
        limit: usize,
    ) -> DbResult<Vec<LogLine>>;
}
