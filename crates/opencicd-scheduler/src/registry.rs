//! Agent registry.

use chrono::{DateTime, Utc};
use opencicd_core::agent::{Agent, AgentFilter, AgentRegistration};
use opencicd_core::lifecycle::{AgentEvent, AgentState};
use opencicd_core::{AgentId, Error, Result};
use opencicd_db::DbError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apply::{Applier, Command};

pub struct AgentRegistry {
    applier: Arc<Applier>,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(applier: Arc<Applier>, heartbeat_timeout: Duration) -> Self {
        Self {
            applier,
            heartbeat_timeout,
        }
    }

    /// Create an agent, or bring a known one back to IDLE with the capabilities it reports now.
    ///
    /// An agent that re-registers while it still holds a run has evidently lost it, so the run
    /// is failed first.
    pub async fn register(&self, registration: AgentRegistration) -> Result<Agent> {
        if registration.id.as_str().trim().is_empty() {
            return Err(Error::InvalidInput("agent id must not be empty".to_string()));
        }

        let agent_id = registration.id.clone();
        let known = match self.applier.store.get_agent(&agent_id).await {
            Ok(_) => true,
            Err(DbError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        let (_, committed) = if known {
            self.applier
                .with_agent(&agent_id, |uow| {
                    let state = uow
                        .agent()
                        .map(|a| a.state)
                        .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
                    if state.is_busy() {
                        uow.fire(
                            Command::Agent(AgentEvent::Fail),
                            Some("agent re-registered".to_string()),
                        )?;
                    }

                    if let Some(agent) = uow.agent_mut() {
                        agent.capabilities = registration.capabilities;
                        if let Some(name) = registration.name {
                            agent.name = name;
                        }
                    }

                    match uow.agent().map(|a| a.state) {
                        Some(AgentState::Failed | AgentState::Offline) => {
                            uow.fire(Command::Agent(AgentEvent::Reconnect), None)
                        }
                        _ => uow.fire(Command::Agent(AgentEvent::PollOrHeartbeat), None),
                    }
                })
                .await?
        } else {
            let now = self.applier.clock.now();
            self.applier
                .with_agent_slot(&agent_id, |uow| {
                    if uow.agent().is_some() {
                        return Err(Error::Conflict(format!(
                            "agent {agent_id} registered concurrently"
                        )));
                    }
                    uow.insert_agent(Agent::new(registration, now))
                })
                .await?
        };

        let agent = committed
            .agent
            .ok_or_else(|| Error::Internal(format!("agent {agent_id} missing after commit")))?;
        info!(
            agent_id = %agent.id,
            capabilities = ?agent.capabilities,
            reconnected = known,
            "Registered agent"
        );
        // New capabilities may make queued runs eligible.
        self.applier.wake.notify_one();
        Ok(agent)
    }

    /// Refresh liveness. An agent that had been declared lost comes back to IDLE.
    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<Agent> {
        let (_, committed) = self
            .applier
            .with_agent(agent_id, |uow| {
                match uow.agent().map(|a| a.state) {
                    Some(AgentState::Idle) => {
                        uow.fire(Command::Agent(AgentEvent::PollOrHeartbeat), None)?
                    }
                    Some(AgentState::Offline | AgentState::Failed) => uow.fire(
                        Command::Agent(AgentEvent::Reconnect),
                        Some("heartbeat resumed".to_string()),
                    )?,
                    _ => uow.touch_agent(),
                }
                Ok(())
            })
            .await?;

        committed
            .agent
            .ok_or_else(|| Error::Internal(format!("agent {agent_id} missing after commit")))
    }

    pub async fn get(&self, agent_id: &AgentId) -> Result<Agent> {
        Ok(self.applier.store.get_agent(agent_id).await?)
    }

    /// Agents matching `filter`, ordered by identity.
    pub async fn list(&self, filter: AgentFilter) -> Result<impl Iterator<Item = Agent>> {
        let agents = self.applier.store.list_agents().await?;
        Ok(agents.into_iter().filter(move |a| filter.matches(a)))
    }

    /// Force agents whose last heartbeat is older than the timeout OFFLINE.
    ///
    /// Returns the agents that were taken offline. A run held by one of them is failed, and
    /// possibly requeued, in the same transaction.
    pub async fn sweep(&self) -> Result<Vec<AgentId>> {
        let now = self.applier.clock.now();
        let stale: Vec<AgentId> = self
            .applier
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| self.is_stale(a, now))
            .map(|a| a.id)
            .collect();

        let mut offline = Vec::new();
        for agent_id in stale {
            let timeout = self.heartbeat_timeout;
            let result = self
                .applier
                .with_agent(&agent_id, |uow| {
                    // Re-check under the lock: a heartbeat may have landed since the scan.
                    let still_stale = uow.agent().is_some_and(|a| self.is_stale(a, uow.now()));
                    if !still_stale {
                        return Ok(false);
                    }
                    uow.fire(
                        Command::Agent(AgentEvent::HeartbeatTimeout),
                        Some(format!("no heartbeat for {}s", timeout.as_secs())),
                    )?;
                    Ok(true)
                })
                .await;

            match result {
                Ok((true, committed)) => {
                    warn!(
                        agent_id = %agent_id,
                        run_id = ?committed.run.as_ref().map(|r| r.id),
                        "Agent missed heartbeats, marked offline"
                    );
                    offline.push(agent_id);
                }
                Ok((false, _)) => debug!(agent_id = %agent_id, "Agent recovered before sweep"),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to mark agent offline"),
            }
        }
        Ok(offline)
    }

    fn is_stale(&self, agent: &Agent, now: DateTime<Utc>) -> bool {
        let timeout =
            chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or(chrono::Duration::MAX);
        agent.state != AgentState::Offline && now.signed_duration_since(agent.last_heartbeat) > timeout
    }

    /// Sweep on an interval until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Starting heartbeat sweeper");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "Heartbeat sweep failed");
            }
        }
        info!("Heartbeat sweeper stopped");
    }
}
