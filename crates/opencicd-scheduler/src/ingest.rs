//! Agent report ingestion.
//!
//! Reports are validated against the recorded state of the run and the reporting agent, then
//! applied through the lifecycle tables. Duplicates and reports that arrive out of order fail
//! with an error for which [`Error::is_ignorable`] holds, so agents can drop them.

use opencicd_core::lifecycle::{AgentEvent, RunEvent, RunState, StepEvent};
use opencicd_core::report::{AgentReport, LogFragment, ReportKind};
use opencicd_core::run::Run;
use opencicd_core::update::LogLine;
use opencicd_core::{AgentId, Error, ResourceId, Result};
use std::sync::Arc;
use tracing::debug;

use crate::apply::{Applier, Command, UnitOfWork};

pub struct Ingestor {
    applier: Arc<Applier>,
}

impl Ingestor {
    pub fn new(applier: Arc<Applier>) -> Self {
        Self { applier }
    }

    /// Apply one agent report. Returns the run as it stands afterwards.
    pub async fn report(&self, report: AgentReport) -> Result<Run> {
        let AgentReport {
            agent_id,
            run_id,
            event,
            at,
        } = report;

        if let ReportKind::Log(fragment) = event {
            return self.log(&agent_id, run_id, fragment, at).await;
        }

        let result = self
            .applier
            .with_run(run_id, |uow| {
                check_holder(uow, &agent_id, run_id)?;
                uow.touch_agent();
                apply_report(uow, event)
            })
            .await;

        match result {
            Ok((_, committed)) => committed
                .run
                .ok_or_else(|| Error::Internal(format!("run {run_id} missing after commit"))),
            Err(e) => {
                if e.is_ignorable() {
                    debug!(run_id = %run_id, agent_id = %agent_id, error = %e, "Ignored agent report");
                }
                Err(e)
            }
        }
    }

    /// Sequence a log fragment and release whatever became contiguous.
    ///
    /// The run lock is held across sequencing and persisting so that lines of one run reach
    /// the store and the subscribers in sequence order.
    async fn log(
        &self,
        agent_id: &AgentId,
        run_id: ResourceId,
        fragment: LogFragment,
        at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Run> {
        let _guard = self.applier.locks.lock(Some(run_id), None).await;
        let run = self.applier.store.get_run(run_id).await?;

        if run.agent.as_ref() != Some(agent_id) {
            return Err(Error::InvalidInput(format!(
                "run {run_id} is not assigned to agent {agent_id}"
            )));
        }
        if run.state.is_terminal() {
            return Err(Error::OutOfOrder(format!(
                "run {run_id} is {} and accepts no more output",
                run.state
            )));
        }
        if fragment.step >= run.steps.len() {
            return Err(Error::InvalidInput(format!(
                "run {run_id} has no step {}",
                fragment.step
            )));
        }

        let now = self.applier.clock.now();
        let line = LogLine {
            run_id,
            step: fragment.step,
            seq: fragment.seq,
            stream: fragment.stream,
            content: fragment.content,
            timestamp: at.unwrap_or(now),
        };
        let release = self.applier.logs.accept(line, now)?;
        self.applier.release_logs(release).await?;
        Ok(run)
    }
}

/// The reporter must be the agent the run is bound to, and must still hold it.
fn check_holder(uow: &UnitOfWork, agent_id: &AgentId, run_id: ResourceId) -> Result<()> {
    let run = uow
        .run()
        .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
    if run.agent.as_ref() != Some(agent_id) {
        return Err(Error::InvalidInput(format!(
            "run {run_id} is not assigned to agent {agent_id}"
        )));
    }
    let holds = uow.agent().and_then(|a| a.current_run) == Some(run_id);
    if !holds {
        return Err(Error::OutOfOrder(format!(
            "agent {agent_id} no longer holds run {run_id}"
        )));
    }
    Ok(())
}

fn apply_report(uow: &mut UnitOfWork, event: ReportKind) -> Result<()> {
    match event {
        ReportKind::RunStarted => {
            uow.fire(Command::Run(RunEvent::Start), None)?;
            uow.fire(Command::Agent(AgentEvent::Start), None)
        }
        ReportKind::StepStarted { step } => {
            check_step_order(uow, step)?;
            uow.fire(
                Command::Step {
                    index: step,
                    event: StepEvent::Start,
                    exit_code: None,
                },
                None,
            )
        }
        ReportKind::StepSucceeded { step, exit_code } => uow.fire(
            Command::Step {
                index: step,
                event: StepEvent::Succeed,
                exit_code: Some(exit_code),
            },
            None,
        ),
        ReportKind::StepFailed {
            step,
            exit_code,
            message,
        } => uow.fire(
            Command::Step {
                index: step,
                event: StepEvent::Fail,
                exit_code: Some(exit_code),
            },
            message,
        ),
        ReportKind::RunFinalized => uow.fire(Command::Run(RunEvent::Finalize), None),
        ReportKind::RunFailed { message } => {
            uow.fire(Command::Run(RunEvent::Fail), Some(message))
        }
        ReportKind::Log(_) => Err(Error::Internal(
            "log fragments are sequenced separately".to_string(),
        )),
    }
}

/// Steps start strictly in declared order, after every predecessor passed.
fn check_step_order(uow: &UnitOfWork, step: usize) -> Result<()> {
    let run = uow
        .run()
        .ok_or_else(|| Error::Internal("no run in unit of work".to_string()))?;
    if run.state != RunState::Running {
        return Err(Error::OutOfOrder(format!(
            "run {} is {}, steps cannot start",
            run.id, run.state
        )));
    }
    let Some(predecessors) = run.steps.get(..step) else {
        return Err(Error::InvalidInput(format!(
            "run {} has no step {step}",
            run.id
        )));
    };
    if let Some(open) = predecessors
        .iter()
        .find(|s| !s.state.lets_successor_start())
    {
        return Err(Error::OutOfOrder(format!(
            "step {step} cannot start before step {} ({}) finished",
            open.index, open.state
        )));
    }
    Ok(())
}
