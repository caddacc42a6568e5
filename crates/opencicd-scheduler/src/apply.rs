//! Transition application.
//!
//! A [`UnitOfWork`] holds the run and agent one operation touches. Events fired into it go
//! through the lifecycle tables, and the actions of each accepted transition may fire further
//! events: a failed step fails its run, a finished run releases its agent, a lost agent fails
//! the run it held. These are processed in order until the cascade settles, and everything
//! then commits as one transaction.
//!
//! The [`Applier`] owns the commit side: per-entity locking, the store write, publishing the
//! stored audit records, keeping the pending queue in step with run states, and the outbound
//! followups (revokes, scheduler wake-ups).

use chrono::{DateTime, Utc};
use opencicd_config::{OnAgentLost, VariableContext};
use opencicd_core::agent::Agent;
use opencicd_core::audit::{EntityRef, TransitionRecord};
use opencicd_core::clock::Clock;
use opencicd_core::dispatch::AssignmentDelivery;
use opencicd_core::fsm::{InvalidTransition, Lifecycle, Machine};
use opencicd_core::lifecycle::{
    AgentAction, AgentEvent, AgentLifecycle, AgentState, RunAction, RunEvent, RunLifecycle,
    RunState, StepAction, StepEvent, StepLifecycle, StepState,
};
use opencicd_core::run::{Run, StepExecution};
use opencicd_core::update::{RunUpdate, UpdatePublisher};
use opencicd_core::{AgentId, Error, ResourceId, Result};
use opencicd_db::{DbError, Store, Transaction, Write};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::locks::EntityLocks;
use crate::logs::{LogSequencer, Release, Sequenced};
use crate::queue::{PendingQueue, QueuedRun};

/// Upper bound on transitions in one cascade.
const MAX_CASCADE: usize = 512;

/// Attempts to lock an agent together with the run it holds before giving up.
const LOCK_RETRIES: usize = 3;

/// An event addressed to one of the entities in a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Run(RunEvent),
    Step {
        index: usize,
        event: StepEvent,
        exit_code: Option<i32>,
    },
    Agent(AgentEvent),
}

/// Work done after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    Revoke { agent_id: AgentId, run_id: ResourceId },
    Wake,
}

struct Tracked<T> {
    value: T,
    dirty: bool,
    new: bool,
}

impl<T: Clone> Tracked<T> {
    fn loaded(value: T) -> Self {
        Self {
            value,
            dirty: false,
            new: false,
        }
    }

    fn inserted(value: T) -> Self {
        Self {
            value,
            dirty: true,
            new: true,
        }
    }

    fn write(&self) -> Option<Write<T>> {
        match (self.dirty, self.new) {
            (false, _) => None,
            (true, true) => Some(Write::Insert(self.value.clone())),
            (true, false) => Some(Write::Update(self.value.clone())),
        }
    }
}

pub struct UnitOfWork {
    now: DateTime<Utc>,
    policy: OnAgentLost,
    run: Option<Tracked<Run>>,
    agent: Option<Tracked<Agent>>,
    retries: Vec<Run>,
    audit: Vec<TransitionRecord>,
    followups: Vec<Followup>,
    pending: VecDeque<(Command, Option<String>)>,
    agent_lost: bool,
}

impl UnitOfWork {
    pub fn new(
        now: DateTime<Utc>,
        policy: OnAgentLost,
        run: Option<Run>,
        agent: Option<Agent>,
    ) -> Self {
        Self {
            now,
            policy,
            run: run.map(Tracked::loaded),
            agent: agent.map(Tracked::loaded),
            retries: Vec::new(),
            audit: Vec::new(),
            followups: Vec::new(),
            pending: VecDeque::new(),
            agent_lost: false,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref().map(|t| &t.value)
    }

    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref().map(|t| &t.value)
    }

    /// Audit records produced so far, unnumbered.
    pub fn records(&self) -> &[TransitionRecord] {
        &self.audit
    }

    /// Mutable access to the agent for changes outside its lifecycle (capabilities, name).
    pub fn agent_mut(&mut self) -> Option<&mut Agent> {
        self.agent.as_mut().map(|t| {
            t.dirty = true;
            &mut t.value
        })
    }

    /// Refresh the agent's heartbeat without a transition.
    pub fn touch_agent(&mut self) {
        let now = self.now;
        if let Some(agent) = self.agent_mut() {
            agent.last_heartbeat = now;
        }
    }

    /// Add a new run. Writes creation records for the run and each of its steps.
    pub fn insert_run(&mut self, run: Run) -> Result<()> {
        if self.run.is_some() {
            return Err(Error::Internal("unit of work already holds a run".to_string()));
        }
        self.audit.extend(creation_records(&run, self.now));
        self.run = Some(Tracked::inserted(run));
        Ok(())
    }

    /// Add a newly registered agent.
    pub fn insert_agent(&mut self, agent: Agent) -> Result<()> {
        if self.agent.is_some() {
            return Err(Error::Internal(
                "unit of work already holds an agent".to_string(),
            ));
        }
        self.audit.push(TransitionRecord::created(
            EntityRef::Agent {
                id: agent.id.clone(),
            },
            AgentLifecycle::wrap_state(agent.state),
            self.now,
        ));
        self.agent = Some(Tracked::inserted(agent));
        Ok(())
    }

    /// Fire an event and process everything it cascades into.
    ///
    /// An illegal transition anywhere in the cascade fails the whole unit of work, which must
    /// then be discarded.
    pub fn fire(&mut self, command: Command, reason: Option<String>) -> Result<()> {
        self.pending.push_back((command, reason));

        let mut applied = 0;
        while let Some((command, reason)) = self.pending.pop_front() {
            applied += 1;
            if applied > MAX_CASCADE {
                return Err(Error::Internal(
                    "transition cascade did not settle".to_string(),
                ));
            }
            match command {
                Command::Run(event) => self.apply_run(event, reason)?,
                Command::Step {
                    index,
                    event,
                    exit_code,
                } => self.apply_step(index, event, exit_code, reason)?,
                Command::Agent(event) => self.apply_agent(event, reason)?,
            }
        }

        self.apply_agent_lost_policy();
        Ok(())
    }

    fn run_ref(&self) -> Result<&Run> {
        self.run()
            .ok_or_else(|| Error::Internal("no run in unit of work".to_string()))
    }

    fn run_mut(&mut self) -> Result<&mut Run> {
        let tracked = self
            .run
            .as_mut()
            .ok_or_else(|| Error::Internal("no run in unit of work".to_string()))?;
        tracked.dirty = true;
        Ok(&mut tracked.value)
    }

    fn step_mut(&mut self, index: usize) -> Result<&mut StepExecution> {
        let run = self.run_mut()?;
        let run_id = run.id;
        run.steps
            .get_mut(index)
            .ok_or_else(|| Error::InvalidInput(format!("run {run_id} has no step {index}")))
    }

    fn agent_tracked(&mut self) -> Result<&mut Agent> {
        self.agent_mut()
            .ok_or_else(|| Error::Internal("no agent in unit of work".to_string()))
    }

    fn enqueue(&mut self, command: Command, reason: Option<String>) {
        self.pending.push_back((command, reason));
    }

    fn apply_run(&mut self, event: RunEvent, reason: Option<String>) -> Result<()> {
        let run = self.run_mut()?;
        let run_id = run.id;
        let entity = EntityRef::Run { id: run_id };
        let transition = checked(Machine::<RunLifecycle>::new().apply(run.state, event), &entity)?;
        run.state = transition.to;

        let mut record = TransitionRecord::transition(
            entity,
            RunLifecycle::wrap_state(transition.from),
            RunLifecycle::wrap_event(event),
            RunLifecycle::wrap_state(transition.to),
            self.now,
        );
        if let Some(reason) = &reason {
            record = record.with_reason(reason.clone());
        }
        self.audit.push(record);

        for action in transition.actions {
            match action {
                RunAction::BindAgent => {
                    let agent_id = self
                        .agent()
                        .map(|a| a.id.clone())
                        .ok_or_else(|| Error::Internal("no agent to bind".to_string()))?;
                    self.run_mut()?.agent = Some(agent_id);
                }
                RunAction::MarkStarted => {
                    let now = self.now;
                    self.run_mut()?.started_at = Some(now);
                }
                RunAction::AdvanceSteps => self.advance()?,
                RunAction::RevokeAgent => {
                    if let Some(agent_id) = self.run_ref()?.agent.clone() {
                        self.followups.push(Followup::Revoke { agent_id, run_id });
                    }
                }
                RunAction::FinalizeUnstarted => self.enqueue(Command::Run(RunEvent::Finalize), None),
                RunAction::Seal => self.seal(reason.clone())?,
                RunAction::ReleaseAgent => self.release_agent(run_id),
            }
        }
        Ok(())
    }

    /// Stamp a terminal run and settle the steps that never finished.
    fn seal(&mut self, reason: Option<String>) -> Result<()> {
        let now = self.now;
        let run = self.run_mut()?;
        run.finished_at = Some(now);
        if reason.is_some() {
            run.reason = reason;
        }

        let outcome = format!("run {}", run.state);
        let settle: Vec<Command> = run
            .steps
            .iter()
            .filter_map(|step| {
                let event = match step.state {
                    StepState::Queued => StepEvent::Skip,
                    StepState::Running => StepEvent::Fail,
                    _ => return None,
                };
                Some(Command::Step {
                    index: step.index,
                    event,
                    exit_code: None,
                })
            })
            .collect();
        for command in settle {
            self.enqueue(command, Some(outcome.clone()));
        }
        Ok(())
    }

    /// Walk the holding agent back to IDLE.
    fn release_agent(&mut self, run_id: ResourceId) {
        let Some(agent) = self.agent() else {
            return;
        };
        if agent.current_run != Some(run_id) {
            return;
        }
        if agent.state != AgentState::Reporting {
            self.enqueue(Command::Agent(AgentEvent::Complete), None);
        }
        self.enqueue(Command::Agent(AgentEvent::ReportAck), None);
    }

    /// Move a running run forward after a step settled: evaluate the next step's condition,
    /// or finish the run once every step passed.
    fn advance(&mut self) -> Result<()> {
        let run = self.run_ref()?;
        if run.state != RunState::Running {
            return Ok(());
        }

        let Some(index) = run.next_open_step() else {
            if run.all_steps_passed() {
                self.enqueue(Command::Run(RunEvent::AllStepsDone), None);
            }
            return Ok(());
        };

        let step = &run.steps[index];
        if step.state != StepState::Queued {
            return Ok(());
        }
        let Some(condition) = &step.when else {
            return Ok(());
        };

        let ctx = VariableContext::for_step(run, index);
        let next = match opencicd_config::condition::evaluate(&condition.expression, &ctx) {
            Ok(true) => None,
            Ok(false) => Some((
                Command::Step {
                    index,
                    event: StepEvent::Skip,
                    exit_code: None,
                },
                format!("condition `{}` is false", condition.expression),
            )),
            Err(e) => Some((
                Command::Run(RunEvent::Fail),
                format!("step '{}' condition: {e}", step.name),
            )),
        };
        if let Some((command, reason)) = next {
            self.enqueue(command, Some(reason));
        }
        Ok(())
    }

    fn apply_step(
        &mut self,
        index: usize,
        event: StepEvent,
        exit_code: Option<i32>,
        reason: Option<String>,
    ) -> Result<()> {
        let now = self.now;
        let run_id = self.run_ref()?.id;
        let entity = EntityRef::Step { run: run_id, index };

        let step = self.step_mut(index)?;
        let transition = checked(Machine::<StepLifecycle>::new().apply(step.state, event), &entity)?;
        step.state = transition.to;
        let name = step.name.clone();

        let mut record = TransitionRecord::transition(
            entity,
            StepLifecycle::wrap_state(transition.from),
            StepLifecycle::wrap_event(event),
            StepLifecycle::wrap_state(transition.to),
            now,
        )
        .with_run(run_id);
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }
        self.audit.push(record);

        for action in transition.actions {
            match action {
                StepAction::MarkStarted => self.step_mut(index)?.started_at = Some(now),
                StepAction::MarkFinished => {
                    let step = self.step_mut(index)?;
                    step.finished_at = Some(now);
                    step.exit_code = exit_code;
                }
                StepAction::Advance => self.advance()?,
                StepAction::PropagateFailure => {
                    let state = self.run_ref()?.state;
                    if state.is_terminal() || state == RunState::Cancelling {
                        continue;
                    }
                    let reason = match exit_code {
                        Some(code) => format!("step '{name}' failed with exit code {code}"),
                        None => format!("step '{name}' failed"),
                    };
                    self.enqueue(Command::Run(RunEvent::Fail), Some(reason));
                }
            }
        }
        Ok(())
    }

    fn apply_agent(&mut self, event: AgentEvent, reason: Option<String>) -> Result<()> {
        let now = self.now;
        let loaded_run = self.run().map(|r| r.id);

        let agent = self.agent_tracked()?;
        let entity = EntityRef::Agent {
            id: agent.id.clone(),
        };
        let transition =
            checked(Machine::<AgentLifecycle>::new().apply(agent.state, event), &entity)?;
        let held = agent.current_run;
        agent.state = transition.to;

        // Heartbeats only refresh liveness; they are not worth an audit record each.
        if !transition.is_self_loop() {
            let mut record = TransitionRecord::transition(
                entity,
                AgentLifecycle::wrap_state(transition.from),
                AgentLifecycle::wrap_event(event),
                AgentLifecycle::wrap_state(transition.to),
                now,
            );
            let bound = if event == AgentEvent::Assign {
                loaded_run
            } else {
                held
            };
            if let Some(run_id) = bound {
                record = record.with_run(run_id);
            }
            if let Some(reason) = &reason {
                record = record.with_reason(reason.clone());
            }
            self.audit.push(record);
        }

        for action in transition.actions {
            match action {
                AgentAction::Touch => self.agent_tracked()?.last_heartbeat = now,
                AgentAction::BindRun => {
                    let run_id = loaded_run
                        .ok_or_else(|| Error::Internal("no run to bind".to_string()))?;
                    self.agent_tracked()?.current_run = Some(run_id);
                }
                AgentAction::UnbindRun => self.agent_tracked()?.current_run = None,
                AgentAction::DetachRun => self.detach_run(reason.as_deref())?,
                AgentAction::Available => self.followups.push(Followup::Wake),
            }
        }
        Ok(())
    }

    /// The agent is gone: settle the run it held.
    fn detach_run(&mut self, reason: Option<&str>) -> Result<()> {
        let agent = self.agent_tracked()?;
        let Some(run_id) = agent.current_run.take() else {
            return Ok(());
        };
        let agent_id = agent.id.clone();

        let state = self
            .run()
            .filter(|r| r.id == run_id)
            .map(|r| r.state)
            .ok_or_else(|| Error::Internal(format!("run {run_id} held by {agent_id} not loaded")))?;

        match state {
            RunState::Cancelling => self.enqueue(
                Command::Run(RunEvent::Finalize),
                Some(format!("agent {agent_id} lost during cancellation")),
            ),
            state if state.is_terminal() => {}
            _ => {
                let reason = match reason {
                    Some(r) => format!("agent {agent_id} lost: {r}"),
                    None => format!("agent {agent_id} lost"),
                };
                self.enqueue(Command::Run(RunEvent::Fail), Some(reason));
                self.agent_lost = true;
            }
        }
        Ok(())
    }

    /// A run failed because its agent was lost: retry it if the policy allows.
    fn apply_agent_lost_policy(&mut self) {
        if !std::mem::take(&mut self.agent_lost) {
            return;
        }
        let OnAgentLost::Requeue { max_attempts } = self.policy else {
            return;
        };
        let Some(run) = self.run() else {
            return;
        };
        if run.state != RunState::Failed || run.attempt >= max_attempts {
            return;
        }

        let retry = run.retry(self.now);
        self.audit.extend(creation_records(&retry, self.now));
        self.retries.push(retry);
    }
}

fn creation_records(run: &Run, at: DateTime<Utc>) -> Vec<TransitionRecord> {
    std::iter::once(TransitionRecord::created(
        EntityRef::Run { id: run.id },
        RunLifecycle::wrap_state(run.state),
        at,
    ))
    .chain(run.steps.iter().map(|step| {
        TransitionRecord::created(
            EntityRef::Step {
                run: run.id,
                index: step.index,
            },
            StepLifecycle::wrap_state(step.state),
            at,
        )
        .with_run(run.id)
    }))
    .collect()
}

fn checked<T>(result: std::result::Result<T, InvalidTransition>, entity: &EntityRef) -> Result<T> {
    result.map_err(|e| {
        warn!(entity = %entity, state = %e.state, event = %e.event, "Rejected transition");
        e.into()
    })
}

/// Entities as they stand after a commit.
#[derive(Debug, Default)]
pub struct Committed {
    pub run: Option<Run>,
    pub agent: Option<Agent>,
    /// Retry runs created by the agent-lost policy.
    pub retries: Vec<Run>,
    pub records: Vec<TransitionRecord>,
}

pub struct Applier {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) delivery: Arc<dyn AssignmentDelivery>,
    pub(crate) publisher: Arc<dyn UpdatePublisher>,
    pub(crate) queue: Arc<PendingQueue>,
    pub(crate) logs: Arc<LogSequencer>,
    pub(crate) locks: EntityLocks,
    pub(crate) wake: Arc<Notify>,
    pub(crate) policy: OnAgentLost,
}

impl Applier {
    pub fn begin(&self, run: Option<Run>, agent: Option<Agent>) -> UnitOfWork {
        UnitOfWork::new(self.clock.now(), self.policy, run, agent)
    }

    /// Operate on a run and the agent it names, both locked.
    pub async fn with_run<T, F>(&self, run_id: ResourceId, f: F) -> Result<(T, Committed)>
    where
        F: FnOnce(&mut UnitOfWork) -> Result<T>,
    {
        let _run_guard = self.locks.lock(Some(run_id), None).await;
        let run = self.store.get_run(run_id).await?;
        let agent_id = run.agent.clone();
        let _agent_guard = self.locks.lock(None, agent_id.as_ref()).await;
        let agent = match &agent_id {
            Some(id) => Some(self.store.get_agent(id).await?),
            None => None,
        };

        let mut uow = self.begin(Some(run), agent);
        let value = f(&mut uow)?;
        Ok((value, self.commit(uow).await?))
    }

    /// Operate on an agent and the run it currently holds, both locked.
    ///
    /// The held run is read before locking. If the agent let go of it or picked up another one
    /// by the time the locks are taken, the read is retried.
    pub async fn with_agent<T, F>(&self, agent_id: &AgentId, f: F) -> Result<(T, Committed)>
    where
        F: FnOnce(&mut UnitOfWork) -> Result<T>,
    {
        for _ in 0..LOCK_RETRIES {
            let held = self.store.get_agent(agent_id).await?.current_run;
            let _run_guard = self.locks.lock(held, None).await;
            let _agent_guard = self.locks.lock(None, Some(agent_id)).await;

            let agent = self.store.get_agent(agent_id).await?;
            if agent.current_run != held {
                debug!(agent_id = %agent_id, "Agent changed runs while locking, retrying");
                continue;
            }
            let run = match held {
                Some(id) => Some(self.store.get_run(id).await?),
                None => None,
            };

            let mut uow = self.begin(run, Some(agent));
            let value = f(&mut uow)?;
            return Ok((value, self.commit(uow).await?));
        }
        Err(Error::Conflict(format!(
            "agent {agent_id} kept changing runs"
        )))
    }

    /// Operate on a run and an agent that are not yet bound to each other.
    pub async fn with_pair<T, F>(
        &self,
        run_id: ResourceId,
        agent_id: &AgentId,
        f: F,
    ) -> Result<(T, Committed)>
    where
        F: FnOnce(&mut UnitOfWork) -> Result<T>,
    {
        let _guards = self.locks.lock(Some(run_id), Some(agent_id)).await;
        let run = self.store.get_run(run_id).await?;
        let agent = self.store.get_agent(agent_id).await?;

        let mut uow = self.begin(Some(run), Some(agent));
        let value = f(&mut uow)?;
        Ok((value, self.commit(uow).await?))
    }

    /// Lock a single agent that may not exist yet.
    pub async fn with_agent_slot<T, F>(&self, agent_id: &AgentId, f: F) -> Result<(T, Committed)>
    where
        F: FnOnce(&mut UnitOfWork) -> Result<T>,
    {
        let _guard = self.locks.lock(None, Some(agent_id)).await;
        let agent = match self.store.get_agent(agent_id).await {
            Ok(agent) => Some(agent),
            Err(DbError::NotFound(_)) => None,
            Err(e) => return Err(self.storage_failure(e)),
        };

        let mut uow = self.begin(None, agent);
        let value = f(&mut uow)?;
        Ok((value, self.commit(uow).await?))
    }

    /// Write a unit of work and run its followups.
    pub async fn commit(&self, uow: UnitOfWork) -> Result<Committed> {
        let UnitOfWork {
            run,
            agent,
            retries,
            audit,
            followups,
            ..
        } = uow;

        let mut tx = Transaction::new();
        tx.runs.extend(run.as_ref().and_then(Tracked::write));
        tx.runs.extend(retries.iter().cloned().map(Write::Insert));
        tx.agents.extend(agent.as_ref().and_then(Tracked::write));
        tx.audit = audit;

        let run_dirty = run.as_ref().is_some_and(|t| t.dirty);
        // A finishing run's held output is written with its final state.
        let closing = run
            .as_ref()
            .filter(|t| t.dirty && t.value.state.is_terminal())
            .map(|t| self.logs.close(t.value.id, self.clock.now()));
        if let Some(release) = &closing {
            tx.logs = release.lines();
        }

        let mut committed = Committed {
            run: run.map(|t| t.value),
            agent: agent.as_ref().map(|t| t.value.clone()),
            retries,
            records: Vec::new(),
        };
        if tx.is_empty() {
            return Ok(committed);
        }

        committed.records = self
            .store
            .commit(tx)
            .await
            .map_err(|e| self.storage_failure(e))?;

        // Mirror the store's version bump.
        if run_dirty {
            if let Some(run) = committed.run.as_mut() {
                run.version += 1;
            }
        }
        if agent.as_ref().is_some_and(|t| t.dirty) {
            if let Some(agent) = committed.agent.as_mut() {
                agent.version += 1;
            }
        }
        for retry in committed.retries.iter_mut() {
            retry.version += 1;
        }

        for record in &committed.records {
            self.publisher
                .publish(RunUpdate::Transition(record.clone()));
        }
        if let Some(release) = closing {
            self.settle_logs(release);
        }

        let mut wake = followups.contains(&Followup::Wake);
        let written = committed
            .run
            .iter()
            .filter(|_| run_dirty)
            .chain(committed.retries.iter());
        for run in written {
            if run.state == RunState::Pending {
                wake |= self.queue.push(QueuedRun::from(run));
            } else {
                self.queue.remove(run.id);
            }
            if run.state.is_terminal() {
                info!(run_id = %run.id, state = %run.state, reason = ?run.reason, "Run finished");
            }
        }
        for retry in &committed.retries {
            info!(run_id = %retry.id, retry_of = ?retry.retry_of, attempt = retry.attempt, "Requeued run");
        }

        for followup in followups {
            if let Followup::Revoke { agent_id, run_id } = followup {
                let delivery = self.delivery.clone();
                tokio::spawn(async move {
                    if let Err(e) = delivery.revoke(&agent_id, run_id).await {
                        warn!(agent_id = %agent_id, run_id = %run_id, error = %e, "Failed to revoke assignment");
                    }
                });
            }
        }
        if wake {
            self.wake.notify_one();
        }

        Ok(committed)
    }

    /// Persist sequenced log output, then settle and publish it in order. Nothing is
    /// settled if the store rejects the lines.
    pub async fn release_logs(&self, release: Release) -> Result<()> {
        let lines = release.lines();
        if !lines.is_empty() {
            self.store
                .append_logs(lines)
                .await
                .map_err(|e| self.storage_failure(e))?;
        }
        self.settle_logs(release);
        Ok(())
    }

    /// Release one run's expired log holes under its lock.
    pub async fn flush_run_logs(&self, run_id: ResourceId) -> Result<()> {
        let _guard = self.locks.lock(Some(run_id), None).await;
        let release = self.logs.flush_expired(run_id, self.clock.now());
        self.release_logs(release).await
    }

    fn settle_logs(&self, release: Release) {
        for item in self.logs.settle(release) {
            self.publisher.publish(match item {
                Sequenced::Line(line) => RunUpdate::Log(line),
                Sequenced::Gap(gap) => {
                    warn!(
                        run_id = %gap.run_id,
                        step = gap.step,
                        from_seq = gap.from_seq,
                        to_seq = gap.to_seq,
                        "Log fragments missing"
                    );
                    RunUpdate::Gap(gap)
                }
            });
        }
    }

    fn storage_failure(&self, e: DbError) -> Error {
        match &e {
            DbError::Conflict(_) => debug!(error = %e, "Lost commit race"),
            DbError::NotFound(_) | DbError::Duplicate(_) => debug!(error = %e, "Commit rejected"),
            DbError::Unavailable(_) => error!(error = %e, "Storage failure"),
        }
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencicd_core::agent::AgentRegistration;
    use opencicd_core::job::{Job, JobDefinition, StepCondition, StepDefinition};
    use opencicd_core::lifecycle::EntityState;
    use opencicd_core::run::RunRequest;
    use std::collections::{BTreeMap, BTreeSet};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn step(name: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            command: format!("make {name}"),
            env: BTreeMap::new(),
            when: None,
        }
    }

    fn run_of(steps: Vec<StepDefinition>) -> Run {
        let job = Job::create(
            JobDefinition {
                name: "build".to_string(),
                repository: "https://example.com/app.git".to_string(),
                branches: vec![],
                requires: BTreeSet::new(),
                priority: 0,
                env: BTreeMap::new(),
                steps,
            },
            now(),
        )
        .unwrap();
        let request = RunRequest {
            branch: Some("feature".to_string()),
            ..Default::default()
        };
        Run::new(&job, request, now())
    }

    fn agent() -> Agent {
        Agent::new(
            AgentRegistration {
                id: AgentId::from("agent-1"),
                name: None,
                capabilities: BTreeSet::new(),
            },
            now(),
        )
    }

    /// A run and agent that have gone through assignment and start.
    fn started(steps: Vec<StepDefinition>, policy: OnAgentLost) -> UnitOfWork {
        let mut uow = UnitOfWork::new(now(), policy, Some(run_of(steps)), Some(agent()));
        uow.fire(Command::Run(RunEvent::Assign), None).unwrap();
        uow.fire(Command::Agent(AgentEvent::Assign), None).unwrap();
        uow.fire(Command::Run(RunEvent::Start), None).unwrap();
        uow.fire(Command::Agent(AgentEvent::Start), None).unwrap();
        uow
    }

    fn step_event(index: usize, event: StepEvent, exit_code: Option<i32>) -> Command {
        Command::Step {
            index,
            event,
            exit_code,
        }
    }

    fn step_states(uow: &UnitOfWork) -> Vec<StepState> {
        uow.run().unwrap().steps.iter().map(|s| s.state).collect()
    }

    #[test]
    fn test_assignment_binds_both_sides() {
        let uow = started(vec![step("a")], OnAgentLost::Fail);
        let run = uow.run().unwrap();
        let agent = uow.agent().unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.agent.as_ref(), Some(&agent.id));
        assert_eq!(agent.current_run, Some(run.id));
        assert_eq!(agent.state, AgentState::Running);
    }

    #[test]
    fn test_last_step_success_completes_run() {
        let mut uow = started(vec![step("a")], OnAgentLost::Fail);
        uow.fire(step_event(0, StepEvent::Start, None), None).unwrap();
        uow.fire(step_event(0, StepEvent::Succeed, Some(0)), None)
            .unwrap();
        assert_eq!(uow.run().unwrap().state, RunState::Completing);

        uow.fire(Command::Run(RunEvent::Finalize), None).unwrap();
        assert_eq!(uow.run().unwrap().state, RunState::Completed);
        assert_eq!(uow.agent().unwrap().state, AgentState::Idle);
        assert_eq!(uow.agent().unwrap().current_run, None);
    }

    #[test]
    fn test_step_failure_fails_run_and_releases_agent() {
        let mut uow = started(vec![step("a"), step("b"), step("c")], OnAgentLost::Fail);
        uow.fire(step_event(0, StepEvent::Start, None), None).unwrap();
        uow.fire(step_event(0, StepEvent::Fail, Some(2)), None)
            .unwrap();

        let run = uow.run().unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(
            run.reason.as_deref(),
            Some("step 'a' failed with exit code 2")
        );
        assert_eq!(
            step_states(&uow),
            vec![StepState::Failed, StepState::Skipped, StepState::Skipped]
        );
        assert_eq!(uow.agent().unwrap().state, AgentState::Idle);
        assert!(uow.followups.contains(&Followup::Wake));
    }

    #[test]
    fn test_false_condition_skips_step() {
        let mut gated = step("deploy");
        gated.when = Some(StepCondition {
            expression: "${git.branch} == 'main'".to_string(),
        });
        let mut uow = started(vec![step("a"), gated, step("c")], OnAgentLost::Fail);
        uow.fire(step_event(0, StepEvent::Start, None), None).unwrap();
        uow.fire(step_event(0, StepEvent::Succeed, Some(0)), None)
            .unwrap();

        assert_eq!(
            step_states(&uow),
            vec![StepState::Success, StepState::Skipped, StepState::Queued]
        );
        let skip = uow
            .records()
            .iter()
            .find(|r| r.to == EntityState::Step(StepState::Skipped))
            .unwrap();
        assert!(skip.reason.as_deref().unwrap().contains("is false"));
    }

    #[test]
    fn test_illegal_event_is_rejected() {
        let mut uow = started(vec![step("a")], OnAgentLost::Fail);
        let err = uow
            .fire(step_event(0, StepEvent::Succeed, Some(0)), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        assert!(err.is_ignorable());
    }

    #[test]
    fn test_agent_loss_fails_run() {
        let mut uow = started(vec![step("a")], OnAgentLost::Fail);
        uow.fire(
            Command::Agent(AgentEvent::HeartbeatTimeout),
            Some("heartbeat timeout".to_string()),
        )
        .unwrap();

        assert_eq!(uow.agent().unwrap().state, AgentState::Offline);
        assert_eq!(uow.agent().unwrap().current_run, None);
        let run = uow.run().unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(
            run.reason.as_deref(),
            Some("agent agent-1 lost: heartbeat timeout")
        );
        assert!(uow.retries.is_empty());
    }

    #[test]
    fn test_agent_loss_requeues_under_policy() {
        let mut uow = started(vec![step("a")], OnAgentLost::Requeue { max_attempts: 2 });
        uow.fire(Command::Agent(AgentEvent::HeartbeatTimeout), None)
            .unwrap();

        let original = uow.run().unwrap().id;
        assert_eq!(uow.retries.len(), 1);
        let retry = &uow.retries[0];
        assert_eq!(retry.state, RunState::Pending);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.retry_of, Some(original));
        assert!(uow
            .records()
            .iter()
            .any(|r| r.entity == EntityRef::Run { id: retry.id }));
    }

    #[test]
    fn test_requeue_stops_at_max_attempts() {
        let mut uow = started(vec![step("a")], OnAgentLost::Requeue { max_attempts: 1 });
        uow.fire(Command::Agent(AgentEvent::HeartbeatTimeout), None)
            .unwrap();
        assert!(uow.retries.is_empty());
    }

    #[test]
    fn test_cancel_running_revokes_then_finalizes() {
        let mut uow = started(vec![step("a"), step("b")], OnAgentLost::Fail);
        uow.fire(step_event(0, StepEvent::Start, None), None).unwrap();
        uow.fire(Command::Run(RunEvent::Cancel), None).unwrap();

        assert_eq!(uow.run().unwrap().state, RunState::Cancelling);
        assert!(matches!(uow.followups[0], Followup::Revoke { .. }));

        uow.fire(Command::Run(RunEvent::Finalize), None).unwrap();
        assert_eq!(uow.run().unwrap().state, RunState::Cancelled);
        assert_eq!(
            step_states(&uow),
            vec![StepState::Failed, StepState::Skipped]
        );
        assert_eq!(uow.agent().unwrap().state, AgentState::Idle);
    }

    #[test]
    fn test_cancel_pending_finishes_immediately() {
        let mut uow = UnitOfWork::new(now(), OnAgentLost::Fail, Some(run_of(vec![step("a")])), None);
        uow.fire(Command::Run(RunEvent::Cancel), None).unwrap();
        assert_eq!(uow.run().unwrap().state, RunState::Cancelled);
        assert_eq!(step_states(&uow), vec![StepState::Skipped]);
    }

    #[test]
    fn test_heartbeat_writes_no_record() {
        let mut uow = UnitOfWork::new(now(), OnAgentLost::Fail, None, Some(agent()));
        uow.fire(Command::Agent(AgentEvent::PollOrHeartbeat), None)
            .unwrap();
        assert!(uow.records().is_empty());
        assert!(uow.agent.as_ref().unwrap().dirty);
    }

    #[test]
    fn test_agent_records_carry_run() {
        let uow = started(vec![step("a")], OnAgentLost::Fail);
        let run_id = uow.run().unwrap().id;
        let assigned = uow
            .records()
            .iter()
            .find(|r| r.to == EntityState::Agent(AgentState::Assigned))
            .unwrap();
        assert_eq!(assigned.run_id, Some(run_id));
    }
}
