//! Shared harness for control plane scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use opencicd_config::{OnAgentLost, SystemConfig};
use opencicd_core::agent::{Agent, AgentRegistration};
use opencicd_core::audit::{EntityRef, check_exclusive_assignment, replay};
use opencicd_core::clock::FakeClock;
use opencicd_core::dispatch::{Assignment, AssignmentDelivery};
use opencicd_core::job::{Job, JobDefinition, StepDefinition};
use opencicd_core::lifecycle::{AgentLifecycle, RunLifecycle, StepLifecycle};
use opencicd_core::report::{AgentReport, LogFragment, ReportKind};
use opencicd_core::run::{Run, RunRequest};
use opencicd_core::update::LogStream;
use opencicd_core::{AgentId, Error, ResourceId, Result};
use opencicd_db::{MemoryStore, Store};
use opencicd_scheduler::ControlPlane;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Delivery double that records what it was asked to do.
#[derive(Default)]
pub struct RecordingDelivery {
    pub delivered: Mutex<Vec<Assignment>>,
    pub revoked: Mutex<Vec<(AgentId, ResourceId)>>,
    pub unreachable: Mutex<Vec<AgentId>>,
}

#[async_trait]
impl AssignmentDelivery for RecordingDelivery {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, assignment: &Assignment) -> Result<()> {
        if self.unreachable.lock().contains(&assignment.agent_id) {
            return Err(Error::Delivery(format!(
                "agent {} unreachable",
                assignment.agent_id
            )));
        }
        self.delivered.lock().push(assignment.clone());
        Ok(())
    }

    async fn revoke(&self, agent_id: &AgentId, run_id: ResourceId) -> Result<()> {
        self.revoked.lock().push((agent_id.clone(), run_id));
        Ok(())
    }
}

pub struct Harness {
    pub plane: Arc<ControlPlane>,
    pub store: Arc<MemoryStore>,
    pub clock: FakeClock,
    pub delivery: Arc<RecordingDelivery>,
}

impl Harness {
    pub async fn new(policy: OnAgentLost) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), policy).await
    }

    pub async fn with_store(store: Arc<MemoryStore>, policy: OnAgentLost) -> Self {
        let clock = FakeClock::new();
        let delivery = Arc::new(RecordingDelivery::default());
        let config = SystemConfig {
            on_agent_lost: policy,
            ..SystemConfig::default()
        };
        let plane = ControlPlane::new(store.clone(), delivery.clone(), Arc::new(clock.clone()), config)
            .await
            .unwrap();
        Self {
            plane: Arc::new(plane),
            store,
            clock,
            delivery,
        }
    }

    pub async fn job(&self, steps: &[&str], requires: &[&str]) -> Job {
        self.plane
            .create_job(definition(steps, requires))
            .await
            .unwrap()
    }

    pub async fn run(&self, job: &Job) -> Run {
        self.plane
            .create_run(job.id, RunRequest::default())
            .await
            .unwrap()
    }

    pub async fn agent(&self, id: &str, capabilities: &[&str]) -> Agent {
        self.plane
            .register_agent(AgentRegistration {
                id: AgentId::from(id),
                name: None,
                capabilities: tags(capabilities),
            })
            .await
            .unwrap()
    }

    pub async fn report(&self, agent: &str, run_id: ResourceId, event: ReportKind) -> Result<Run> {
        self.plane
            .report(AgentReport {
                agent_id: AgentId::from(agent),
                run_id,
                event,
                at: None,
            })
            .await
    }

    pub async fn log(&self, agent: &str, run_id: ResourceId, step: usize, seq: u64) -> Result<Run> {
        self.report(
            agent,
            run_id,
            ReportKind::Log(LogFragment {
                step,
                seq,
                stream: LogStream::Stdout,
                content: format!("line {seq}"),
            }),
        )
        .await
    }

    /// Start a step and report it passed.
    pub async fn pass_step(&self, agent: &str, run_id: ResourceId, step: usize) {
        self.report(agent, run_id, ReportKind::StepStarted { step })
            .await
            .unwrap();
        self.report(agent, run_id, ReportKind::StepSucceeded { step, exit_code: 0 })
            .await
            .unwrap();
    }

    /// Drive an assigned run through every step to COMPLETED.
    pub async fn complete(&self, agent: &str, run_id: ResourceId) -> Run {
        self.report(agent, run_id, ReportKind::RunStarted)
            .await
            .unwrap();
        let steps = self.plane.get_run(run_id).await.unwrap().steps.len();
        for step in 0..steps {
            self.pass_step(agent, run_id, step).await;
        }
        self.report(agent, run_id, ReportKind::RunFinalized)
            .await
            .unwrap()
    }

    /// Every entity of a run, and the agent, replays to its stored state, and no agent was
    /// ever bound to two runs at once.
    pub async fn assert_history_consistent(&self, run_id: ResourceId) {
        let run = self.plane.get_run(run_id).await.unwrap();
        let history = self.store.history(&EntityRef::Run { id: run.id }).await.unwrap();
        assert_eq!(replay::<RunLifecycle>(&history).unwrap(), run.state);

        for step in &run.steps {
            let history = self
                .store
                .history(&EntityRef::Step {
                    run: run.id,
                    index: step.index,
                })
                .await
                .unwrap();
            assert_eq!(replay::<StepLifecycle>(&history).unwrap(), step.state);
        }

        if let Some(agent_id) = &run.agent {
            let agent = self.plane.get_agent(agent_id).await.unwrap();
            let history = self.plane.agent_history(agent_id).await.unwrap();
            assert_eq!(replay::<AgentLifecycle>(&history).unwrap(), agent.state);
        }

        let log = self.plane.audit_log(0, usize::MAX).await.unwrap();
        check_exclusive_assignment(&log).unwrap();
    }

    /// Let spawned followups (revokes) run.
    pub async fn settle(&self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }
}

pub fn step(name: &str) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        command: format!("./ci/{name}.sh"),
        env: BTreeMap::new(),
        when: None,
    }
}

pub fn definition(steps: &[&str], requires: &[&str]) -> JobDefinition {
    JobDefinition {
        name: "build".to_string(),
        repository: "https://example.com/app.git".to_string(),
        branches: vec!["main".to_string(), "release/*".to_string()],
        requires: tags(requires),
        priority: 0,
        env: BTreeMap::new(),
        steps: steps.iter().map(|s| step(s)).collect(),
    }
}

pub fn tags(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}
