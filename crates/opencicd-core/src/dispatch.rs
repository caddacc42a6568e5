//! Outbound assignment delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{AgentId, ResourceId};
use crate::run::{GitInfo, Run};
use crate::Result;

/// A step as handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedStep {
    pub index: usize,
    pub name: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
}

/// Work pushed to an agent after a successful assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub run_id: ResourceId,
    pub agent_id: AgentId,
    pub job_id: ResourceId,
    pub job_name: String,
    pub repository: String,
    pub attempt: u32,
    pub git: GitInfo,
    pub env: BTreeMap<String, String>,
    pub steps: Vec<AssignedStep>,
}

impl Assignment {
    pub fn for_run(run: &Run, agent_id: AgentId) -> Self {
        Self {
            run_id: run.id,
            agent_id,
            job_id: run.job_id,
            job_name: run.job_name.clone(),
            repository: run.repository.clone(),
            attempt: run.attempt,
            git: run.git.clone(),
            env: run.env.clone(),
            steps: run
                .steps
                .iter()
                .map(|s| AssignedStep {
                    index: s.index,
                    name: s.name.clone(),
                    command: s.command.clone(),
                    env: s.env.clone(),
                })
                .collect(),
        }
    }
}

/// Transport-supplied capability to reach agents.
///
/// A `deliver` error means the agent is presumed unreachable; the caller turns it into an
/// agent FAIL.
#[async_trait]
pub trait AssignmentDelivery: Send + Sync {
    /// Name of this delivery transport.
    fn name(&self) -> &'static str;

    async fn deliver(&self, assignment: &Assignment) -> Result<()>;

    /// Ask the agent to stop working on `run_id`. Best effort.
    async fn revoke(&self, agent_id: &AgentId, run_id: ResourceId) -> Result<()>;
}
