//! Mailbox assignment delivery.
//!
//! Agents reach the control plane over plain HTTP, so assignments and revocations are parked
//! in a per-agent mailbox that the agent drains when it polls.

use async_trait::async_trait;
use opencicd_core::dispatch::{Assignment, AssignmentDelivery};
use opencicd_core::{AgentId, ResourceId, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// What an agent collects on its next poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Mailbox {
    pub assignment: Option<Assignment>,
    /// Runs the agent must stop working on.
    pub revoked: Vec<ResourceId>,
}

#[derive(Default)]
pub struct MailboxDelivery {
    boxes: Mutex<HashMap<AgentId, Mailbox>>,
}

impl MailboxDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the agent's mailbox.
    pub fn take(&self, agent_id: &AgentId) -> Mailbox {
        self.boxes.lock().remove(agent_id).unwrap_or_default()
    }

    /// Look without collecting.
    pub fn peek(&self, agent_id: &AgentId) -> Mailbox {
        self.boxes.lock().get(agent_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl AssignmentDelivery for MailboxDelivery {
    fn name(&self) -> &'static str {
        "mailbox"
    }

    async fn deliver(&self, assignment: &Assignment) -> Result<()> {
        let mut boxes = self.boxes.lock();
        let mailbox = boxes.entry(assignment.agent_id.clone()).or_default();
        if let Some(stale) = mailbox.assignment.replace(assignment.clone()) {
            debug!(agent_id = %assignment.agent_id, run_id = %stale.run_id, "Replaced uncollected assignment");
        }
        Ok(())
    }

    async fn revoke(&self, agent_id: &AgentId, run_id: ResourceId) -> Result<()> {
        let mut boxes = self.boxes.lock();
        let mailbox = boxes.entry(agent_id.clone()).or_default();
        // Never collected: the agent does not need to hear about it at all.
        if mailbox.assignment.as_ref().is_some_and(|a| a.run_id == run_id) {
            mailbox.assignment = None;
            return Ok(());
        }
        if !mailbox.revoked.contains(&run_id) {
            mailbox.revoked.push(run_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencicd_core::run::GitInfo;
    use std::collections::BTreeMap;

    fn assignment(agent: &str) -> Assignment {
        Assignment {
            run_id: ResourceId::new(),
            agent_id: AgentId::from(agent),
            job_id: ResourceId::new(),
            job_name: "build".to_string(),
            repository: "https://example.com/app.git".to_string(),
            attempt: 1,
            git: GitInfo::default(),
            env: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_poll_collects_once() {
        let delivery = MailboxDelivery::new();
        let a = assignment("agent-1");
        delivery.deliver(&a).await.unwrap();

        let agent = AgentId::from("agent-1");
        assert_eq!(delivery.peek(&agent).assignment.as_ref(), Some(&a));
        assert_eq!(delivery.take(&agent).assignment, Some(a));
        assert_eq!(delivery.take(&agent), Mailbox::default());
    }

    #[tokio::test]
    async fn test_revoking_uncollected_assignment_drops_it() {
        let delivery = MailboxDelivery::new();
        let a = assignment("agent-1");
        delivery.deliver(&a).await.unwrap();
        delivery.revoke(&a.agent_id, a.run_id).await.unwrap();

        assert_eq!(delivery.take(&a.agent_id), Mailbox::default());
    }

    #[tokio::test]
    async fn test_revoking_collected_assignment_notifies_agent() {
        let delivery = MailboxDelivery::new();
        let a = assignment("agent-1");
        delivery.deliver(&a).await.unwrap();
        delivery.take(&a.agent_id);

        delivery.revoke(&a.agent_id, a.run_id).await.unwrap();
        delivery.revoke(&a.agent_id, a.run_id).await.unwrap();
        assert_eq!(delivery.take(&a.agent_id).revoked, vec![a.run_id]);
    }
}
