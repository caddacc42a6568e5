//! Registered execution agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::id::{AgentId, ResourceId};
use crate::lifecycle::AgentState;

/// Registration payload sent by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: AgentId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    /// Opaque tags matched against a run's requirements.
    pub capabilities: BTreeSet<String>,
    pub state: AgentState,
    pub last_heartbeat: DateTime<Utc>,
    pub current_run: Option<ResourceId>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    /// A newly registered, idle agent.
    pub fn new(registration: AgentRegistration, now: DateTime<Utc>) -> Self {
        let name = registration
            .name
            .unwrap_or_else(|| registration.id.to_string());
        Self {
            id: registration.id,
            name,
            capabilities: registration.capabilities,
            state: AgentState::Idle,
            last_heartbeat: now,
            current_run: None,
            registered_at: now,
            version: 0,
        }
    }

    /// Capability set is a superset of `requires`.
    pub fn can_run(&self, requires: &BTreeSet<String>) -> bool {
        requires.is_subset(&self.capabilities)
    }

    /// Idle and capable: the scheduler may hand it this work.
    pub fn is_eligible(&self, requires: &BTreeSet<String>) -> bool {
        self.state == AgentState::Idle && self.can_run(requires)
    }
}

/// Filter for listing agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    #[serde(default)]
    pub state: Option<AgentState>,
    /// Agents must carry every one of these tags.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl AgentFilter {
    pub fn idle_with(capabilities: &BTreeSet<String>) -> Self {
        Self {
            state: Some(AgentState::Idle),
            capabilities: capabilities.clone(),
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.state.is_none_or(|s| s == agent.state) && agent.can_run(&self.capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(caps: &[&str]) -> Agent {
        Agent::new(
            AgentRegistration {
                id: AgentId::from("agent-1"),
                name: None,
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_name_defaults_to_id() {
        assert_eq!(agent(&[]).name, "agent-1");
    }

    #[test]
    fn test_capability_superset_matching() {
        let a = agent(&["docker", "linux"]);
        assert!(a.can_run(&BTreeSet::new()));
        assert!(a.can_run(&["docker".to_string()].into()));
        assert!(!a.can_run(&["docker".to_string(), "gpu".to_string()].into()));
    }

    #[test]
    fn test_filter_by_state_and_capability() {
        let mut a = agent(&["docker"]);
        let filter = AgentFilter::idle_with(&["docker".to_string()].into());
        assert!(filter.matches(&a));
        a.state = AgentState::Running;
        assert!(!filter.matches(&a));
        assert!(AgentFilter::default().matches(&a));
    }
}
