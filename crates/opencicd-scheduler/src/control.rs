//! The control plane facade.
//!
//! Wires the store, scheduler, registry, ingestion and fan-out together and exposes the
//! operations transports call.

use opencicd_config::{SystemConfig, branch_matches, validate_job};
use opencicd_core::agent::{Agent, AgentFilter, AgentRegistration};
use opencicd_core::audit::{EntityRef, TransitionRecord};
use opencicd_core::clock::Clock;
use opencicd_core::dispatch::{Assignment, AssignmentDelivery};
use opencicd_core::job::{Job, JobDefinition, StepDefinition};
use opencicd_core::lifecycle::RunEvent;
use opencicd_core::report::AgentReport;
use opencicd_core::run::{Run, RunRequest, TriggerKind};
use opencicd_core::update::{LogLine, RunUpdate, UpdatePublisher};
use opencicd_core::{AgentId, Error, ResourceId, Result};
use opencicd_db::{RunFilter, Store};
use std::sync::Arc;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::apply::{Applier, Command};
use crate::fanout::Broadcaster;
use crate::ingest::Ingestor;
use crate::locks::EntityLocks;
use crate::logs::LogSequencer;
use crate::queue::PendingQueue;
use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;

pub struct ControlPlane {
    config: SystemConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    applier: Arc<Applier>,
    registry: Arc<AgentRegistry>,
    scheduler: Arc<Scheduler>,
    ingestor: Ingestor,
    broadcaster: Arc<Broadcaster>,
}

impl ControlPlane {
    /// Build a control plane over `store`. PENDING runs already in the store are queued again.
    pub async fn new(
        store: Arc<dyn Store>,
        delivery: Arc<dyn AssignmentDelivery>,
        clock: Arc<dyn Clock>,
        config: SystemConfig,
    ) -> Result<Self> {
        let pending = store.list_runs(&RunFilter::pending()).await?;
        let queue = Arc::new(PendingQueue::restore(&pending));
        if !queue.is_empty() {
            info!(runs = queue.len(), "Restored pending queue");
        }

        let broadcaster = Arc::new(Broadcaster::new(config.logs.channel_capacity));
        let publisher: Arc<dyn UpdatePublisher> = broadcaster.clone();
        let applier = Arc::new(Applier {
            store: store.clone(),
            clock: clock.clone(),
            delivery,
            publisher,
            queue,
            logs: Arc::new(LogSequencer::new(config.logs.gap_window)),
            locks: EntityLocks::new(),
            wake: Arc::new(Notify::new()),
            policy: config.on_agent_lost,
        });

        Ok(Self {
            registry: Arc::new(AgentRegistry::new(
                applier.clone(),
                config.agents.heartbeat_timeout,
            )),
            scheduler: Arc::new(Scheduler::new(applier.clone())),
            ingestor: Ingestor::new(applier.clone()),
            config,
            store,
            clock,
            applier,
            broadcaster,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Storage liveness.
    pub async fn ping(&self) -> Result<()> {
        Ok(self.store.ping().await?)
    }

    // Jobs

    pub async fn create_job(&self, definition: JobDefinition) -> Result<Job> {
        validate_job(&definition)?;
        let job = Job::create(definition, self.clock.now())?;
        let job = self.store.insert_job(job).await?;
        info!(job_id = %job.id, name = %job.name, "Created job");
        Ok(job)
    }

    /// Replace a job's steps, producing its next version. Existing runs keep the version they
    /// were created from.
    pub async fn update_job_steps(
        &self,
        job_id: ResourceId,
        steps: Vec<StepDefinition>,
    ) -> Result<Job> {
        opencicd_config::job::validate_steps(&steps)?;
        let current = self.store.get_job(job_id).await?;
        let next = current.with_steps(steps, self.clock.now())?;
        let job = self.store.insert_job_version(next).await?;
        info!(job_id = %job.id, version = job.version, "Updated job steps");
        Ok(job)
    }

    pub async fn delete_job(&self, job_id: ResourceId) -> Result<Job> {
        let job = self.store.mark_job_deleted(job_id).await?;
        info!(job_id = %job.id, "Deleted job");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: ResourceId) -> Result<Job> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn get_job_version(&self, job_id: ResourceId, version: u32) -> Result<Job> {
        Ok(self.store.get_job_version(job_id, version).await?)
    }

    pub async fn list_jobs(&self, include_deleted: bool) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs(include_deleted).await?)
    }

    // Runs

    /// Create a PENDING run of the latest job version and queue it.
    pub async fn create_run(&self, job_id: ResourceId, request: RunRequest) -> Result<Run> {
        let job = self.store.get_job(job_id).await?;
        if job.deleted {
            return Err(Error::InvalidInput(format!("job {job_id} is deleted")));
        }
        if request.trigger == TriggerKind::Push {
            let branch = request.branch.as_deref().ok_or_else(|| {
                Error::InvalidInput("push-triggered runs need a branch".to_string())
            })?;
            if !branch_matches(&job.branches, branch) {
                return Err(Error::InvalidInput(format!(
                    "branch '{branch}' does not match the branches of job '{}'",
                    job.name
                )));
            }
        }

        let run = Run::new(&job, request, self.clock.now());
        let mut uow = self.applier.begin(None, None);
        uow.insert_run(run)?;
        let committed = self.applier.commit(uow).await?;
        let run = committed
            .run
            .ok_or_else(|| Error::Internal("run missing after commit".to_string()))?;

        info!(
            run_id = %run.id,
            job_id = %job.id,
            job_version = run.job_version,
            priority = run.priority,
            trigger = run.trigger.kind.as_str(),
            "Queued run"
        );
        Ok(run)
    }

    /// Cancel a run. A run that never started is cancelled at once; a running one waits in
    /// CANCELLING until its agent confirms it stopped.
    pub async fn cancel_run(&self, run_id: ResourceId, reason: Option<String>) -> Result<Run> {
        let (_, committed) = self
            .applier
            .with_run(run_id, |uow| uow.fire(Command::Run(RunEvent::Cancel), reason))
            .await?;
        let run = committed
            .run
            .ok_or_else(|| Error::Internal(format!("run {run_id} missing after commit")))?;
        info!(run_id = %run_id, state = %run.state, "Cancel requested");
        Ok(run)
    }

    pub async fn get_run(&self, run_id: ResourceId) -> Result<Run> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        Ok(self.store.list_runs(filter).await?)
    }

    /// Audit records of a run and its steps.
    pub async fn run_history(&self, run_id: ResourceId) -> Result<Vec<TransitionRecord>> {
        Ok(self.store.run_history(run_id).await?)
    }

    pub async fn run_logs(
        &self,
        run_id: ResourceId,
        step: Option<usize>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<LogLine>> {
        // Surface an unknown run as NotFound rather than an empty page.
        self.store.get_run(run_id).await?;
        Ok(self.store.logs(run_id, step, offset, limit).await?)
    }

    pub async fn audit_log(&self, after: u64, limit: usize) -> Result<Vec<TransitionRecord>> {
        Ok(self.store.audit_log(after, limit).await?)
    }

    /// Runs waiting for an agent, in service order.
    pub fn queued(&self) -> Vec<ResourceId> {
        self.applier
            .queue
            .snapshot()
            .into_iter()
            .map(|e| e.run_id)
            .collect()
    }

    // Agents

    pub async fn register_agent(&self, registration: AgentRegistration) -> Result<Agent> {
        self.registry.register(registration).await
    }

    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<Agent> {
        self.registry.heartbeat(agent_id).await
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<Agent> {
        self.registry.get(agent_id).await
    }

    pub async fn list_agents(&self, filter: AgentFilter) -> Result<Vec<Agent>> {
        Ok(self.registry.list(filter).await?.collect())
    }

    pub async fn agent_history(&self, agent_id: &AgentId) -> Result<Vec<TransitionRecord>> {
        self.registry.get(agent_id).await?;
        Ok(self
            .store
            .history(&EntityRef::Agent {
                id: agent_id.clone(),
            })
            .await?)
    }

    /// Apply a report from an agent.
    pub async fn report(&self, report: AgentReport) -> Result<Run> {
        self.ingestor.report(report).await
    }

    // Time-driven work. The background loops call these; tests call them directly.

    pub async fn tick(&self) -> Result<Vec<Assignment>> {
        self.scheduler.tick().await
    }

    pub async fn sweep(&self) -> Result<Vec<AgentId>> {
        self.registry.sweep().await
    }

    /// Release log fragments whose gap window expired.
    pub async fn flush_logs(&self) -> Result<()> {
        for run_id in self.applier.logs.expired(self.clock.now()) {
            self.applier.flush_run_logs(run_id).await?;
        }
        Ok(())
    }

    // Live updates

    pub fn subscribe(&self, run_id: Option<ResourceId>) -> broadcast::Receiver<RunUpdate> {
        self.broadcaster.subscribe(run_id)
    }

    /// Start the scheduler, the heartbeat sweeper and the log gap flusher.
    pub fn spawn_background(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let scheduler = tokio::spawn(
            self.scheduler
                .clone()
                .run(self.config.scheduler.tick_interval, shutdown.clone()),
        );
        let sweeper = tokio::spawn(
            self.registry
                .clone()
                .run_sweeper(self.config.agents.sweep_interval, shutdown.clone()),
        );

        let plane = self.clone();
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(plane.config.logs.gap_window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = plane.flush_logs().await {
                    warn!(error = %e, "Log gap flush failed");
                }
            }
        });

        vec![scheduler, sweeper, flusher]
    }
}
