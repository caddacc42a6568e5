//! Push-assignment scheduler.
//!
//! Each tick walks the pending queue in service order and hands every run the lowest-identity
//! IDLE agent that carries all of its required capabilities. A run without an eligible agent
//! stays queued and does not hold up the runs behind it.

use opencicd_config::VariableContext;
use opencicd_core::agent::Agent;
use opencicd_core::dispatch::Assignment;
use opencicd_core::lifecycle::{AgentEvent, AgentState, RunEvent, RunState};
use opencicd_core::run::Run;
use opencicd_core::{AgentId, Error, ResourceId, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apply::{Applier, Command};

/// Result of trying to bind one run to one agent.
#[derive(Debug)]
enum Attempt {
    Assigned(Box<Assignment>),
    /// The run left PENDING (cancelled, or assigned by an earlier tick).
    RunGone,
    /// The agent stopped being eligible since the scan.
    AgentBusy,
}

pub struct Scheduler {
    applier: Arc<Applier>,
    tick_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(applier: Arc<Applier>) -> Self {
        Self {
            applier,
            tick_lock: Mutex::new(()),
        }
    }

    /// One scheduling pass. Returns the assignments that were delivered.
    pub async fn tick(&self) -> Result<Vec<Assignment>> {
        let _tick = self.tick_lock.lock().await;

        let queued = self.applier.queue.snapshot();
        if queued.is_empty() {
            return Ok(Vec::new());
        }

        let mut idle: Vec<Agent> = self
            .applier
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.state == AgentState::Idle)
            .collect();
        debug!(queued = queued.len(), idle = idle.len(), "Scheduler tick");

        let mut delivered = Vec::new();
        for entry in queued {
            if idle.is_empty() {
                break;
            }

            while let Some(pos) = idle.iter().position(|a| a.can_run(&entry.requires)) {
                let agent = idle.remove(pos);
                match self.assign(entry.run_id, &agent.id).await {
                    Ok(Attempt::Assigned(assignment)) => {
                        if self.deliver(&assignment).await {
                            delivered.push(*assignment);
                        }
                        break;
                    }
                    Ok(Attempt::RunGone) => {
                        idle.insert(pos, agent);
                        break;
                    }
                    Ok(Attempt::AgentBusy) => continue,
                    Err(e) => {
                        debug!(run_id = %entry.run_id, agent_id = %agent.id, error = %e, "Assignment attempt failed");
                        break;
                    }
                }
            }
        }
        Ok(delivered)
    }

    /// Move the run and the agent to ASSIGNED together, or neither.
    async fn assign(&self, run_id: ResourceId, agent_id: &AgentId) -> Result<Attempt> {
        let (attempt, _) = self
            .applier
            .with_pair(run_id, agent_id, |uow| {
                let (Some(run), Some(agent)) = (uow.run(), uow.agent()) else {
                    return Ok(Attempt::RunGone);
                };
                if run.state != RunState::Pending {
                    return Ok(Attempt::RunGone);
                }
                if !agent.is_eligible(&run.requires) {
                    return Ok(Attempt::AgentBusy);
                }

                uow.fire(Command::Run(RunEvent::Assign), None)?;
                uow.fire(Command::Agent(AgentEvent::Assign), None)?;
                let assignment = uow
                    .run()
                    .map(|run| assignment_for(run, agent_id))
                    .ok_or_else(|| Error::Internal("run vanished after assignment".to_string()))?;
                Ok(Attempt::Assigned(Box::new(assignment)))
            })
            .await?;
        Ok(attempt)
    }

    /// Push an assignment to its agent. An unreachable agent is failed, which in turn fails
    /// the run it was just given.
    async fn deliver(&self, assignment: &Assignment) -> bool {
        let run_id = assignment.run_id;
        let agent_id = &assignment.agent_id;

        let error = match self.applier.delivery.deliver(assignment).await {
            Ok(()) => {
                info!(
                    run_id = %run_id,
                    agent_id = %agent_id,
                    job = %assignment.job_name,
                    transport = self.applier.delivery.name(),
                    "Assigned run"
                );
                return true;
            }
            Err(e) => e,
        };

        warn!(run_id = %run_id, agent_id = %agent_id, error = %error, "Failed to deliver assignment");
        let reason = format!("delivery failed: {error}");
        let result = self
            .applier
            .with_agent(agent_id, |uow| {
                if uow.agent().and_then(|a| a.current_run) != Some(run_id) {
                    return Ok(());
                }
                uow.fire(Command::Agent(AgentEvent::Fail), Some(reason))
            })
            .await;
        if let Err(e) = result {
            warn!(agent_id = %agent_id, error = %e, "Failed to fail unreachable agent");
        }
        false
    }

    /// Tick whenever woken, and at least every `interval`, until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_ms = interval.as_millis() as u64, "Starting scheduler");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.applier.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Scheduler tick failed");
            }
        }
        info!("Scheduler stopped");
    }
}

/// The assignment handed to an agent, with variables in step commands and env resolved.
fn assignment_for(run: &Run, agent_id: &AgentId) -> Assignment {
    let mut assignment = Assignment::for_run(run, agent_id.clone());
    for step in &mut assignment.steps {
        let ctx = VariableContext::for_step(run, step.index);
        step.command = ctx.interpolate(&step.command);
        step.env = ctx.interpolate_map(&step.env);
    }
    assignment
}
