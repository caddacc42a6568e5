//! In-memory store.
//!
//! All state sits behind one lock, so a commit is trivially atomic. Used by the server when no
//! external storage is configured and by every test.

use async_trait::async_trait;
use opencicd_core::agent::Agent;
use opencicd_core::audit::{EntityRef, TransitionRecord};
use opencicd_core::job::Job;
use opencicd_core::run::Run;
use opencicd_core::update::LogLine;
use opencicd_core::{AgentId, ResourceId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::store::{RunFilter, Store, Transaction, Write};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Inner {
    /// Every version of every job, in version order.
    jobs: HashMap<ResourceId, Vec<Job>>,
    runs: HashMap<ResourceId, Run>,
    agents: BTreeMap<AgentId, Agent>,
    audit: Vec<TransitionRecord>,
    /// Index into `audit` per entity.
    by_entity: HashMap<EntityRef, Vec<usize>>,
    logs: HashMap<ResourceId, Vec<LogLine>>,
    /// (lines, bytes) per (run, step).
    log_totals: HashMap<(ResourceId, usize), (u64, u64)>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> DbResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Unavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn with_log_totals(&self, mut run: Run) -> Run {
        for step in &mut run.steps {
            let (lines, bytes) = self
                .log_totals
                .get(&(run.id, step.index))
                .copied()
                .unwrap_or_default();
            step.log_lines = lines;
            step.log_bytes = bytes;
        }
        run
    }

    fn append_logs(&mut self, lines: Vec<LogLine>) {
        for line in lines {
            let totals = self.log_totals.entry((line.run_id, line.step)).or_default();
            totals.0 += 1;
            totals.1 += line.content.len() as u64;
            self.logs.entry(line.run_id).or_default().push(line);
        }
    }

    /// Validate every precondition before touching anything.
    fn check_transaction(&self, tx: &Transaction) -> DbResult<()> {
        for write in &tx.runs {
            let run = write.value();
            match (write, self.runs.get(&run.id)) {
                (Write::Insert(_), Some(_)) => {
                    return Err(DbError::Duplicate(format!("run {}", run.id)));
                }
                (Write::Update(_), None) => return Err(DbError::NotFound(format!("run {}", run.id))),
                (Write::Update(_), Some(stored)) if stored.version != run.version => {
                    return Err(DbError::Conflict(format!(
                        "run {} is at version {}, expected {}",
                        run.id, stored.version, run.version
                    )));
                }
                _ => {}
            }
        }
        for write in &tx.agents {
            let agent = write.value();
            match (write, self.agents.get(&agent.id)) {
                (Write::Insert(_), Some(_)) => {
                    return Err(DbError::Duplicate(format!("agent {}", agent.id)));
                }
                (Write::Update(_), None) => {
                    return Err(DbError::NotFound(format!("agent {}", agent.id)));
                }
                (Write::Update(_), Some(stored)) if stored.version != agent.version => {
                    return Err(DbError::Conflict(format!(
                        "agent {} is at version {}, expected {}",
                        agent.id, stored.version, agent.version
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> DbResult<()> {
        self.check()
    }

    async fn insert_job(&self, job: Job) -> DbResult<Job> {
        self.check()?;
        let mut inner = self.inner.write();
        if inner.jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        inner.jobs.insert(job.id, vec![job.clone()]);
        Ok(job)
    }

    async fn insert_job_version(&self, job: Job) -> DbResult<Job> {
        self.check()?;
        let mut inner = self.inner.write();
        let versions = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?;
        let latest = versions.last().map(|j| j.version).unwrap_or_default();
        if job.version != latest + 1 {
            return Err(DbError::Conflict(format!(
                "job {} is at version {}, cannot store version {}",
                job.id, latest, job.version
            )));
        }
        versions.push(job.clone());
        Ok(job)
    }

    async fn mark_job_deleted(&self, id: ResourceId) -> DbResult<Job> {
        self.check()?;
        let mut inner = self.inner.write();
        let versions = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        for version in versions.iter_mut() {
            version.deleted = true;
        }
        versions
            .last()
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        self.check()?;
        self.inner
            .read()
            .jobs
            .get(&id)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn get_job_version(&self, id: ResourceId, version: u32) -> DbResult<Job> {
        self.check()?;
        self.inner
            .read()
            .jobs
            .get(&id)
            .and_then(|versions| versions.iter().find(|j| j.version == version).cloned())
            .ok_or_else(|| DbError::NotFound(format!("job {} version {}", id, version)))
    }

    async fn list_jobs(&self, include_deleted: bool) -> DbResult<Vec<Job>> {
        self.check()?;
        let inner = self.inner.read();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter_map(|versions| versions.last())
            .filter(|job| include_deleted || !job.deleted)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn get_run(&self, id: ResourceId) -> DbResult<Run> {
        self.check()?;
        let inner = self.inner.read();
        let run = inner
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("run {}", id)))?;
        Ok(inner.with_log_totals(run))
    }

    async fn list_runs(&self, filter: &RunFilter) -> DbResult<Vec<Run>> {
        self.check()?;
        let inner = self.inner.read();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .map(|run| inner.with_log_totals(run.clone()))
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn get_agent(&self, id: &AgentId) -> DbResult<Agent> {
        self.check()?;
        self.inner
            .read()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("agent {}", id)))
    }

    async fn list_agents(&self) -> DbResult<Vec<Agent>> {
        self.check()?;
        Ok(self.inner.read().agents.values().cloned().collect())
    }

    async fn commit(&self, tx: Transaction) -> DbResult<Vec<TransitionRecord>> {
        self.check()?;
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.check_transaction(&tx)?;

        for write in tx.runs {
            let mut run = match write {
                Write::Insert(run) => run,
                Write::Update(run) => run,
            };
            run.version += 1;
            inner.runs.insert(run.id, run);
        }
        for write in tx.agents {
            let mut agent = match write {
                Write::Insert(agent) => agent,
                Write::Update(agent) => agent,
            };
            agent.version += 1;
            inner.agents.insert(agent.id.clone(), agent);
        }

        let mut stored = Vec::with_capacity(tx.audit.len());
        for mut record in tx.audit {
            let index = inner.audit.len();
            let entries = inner.by_entity.entry(record.entity.clone()).or_default();
            record.seq = entries.len() as u64 + 1;
            record.position = index as u64 + 1;
            entries.push(index);
            inner.audit.push(record.clone());
            stored.push(record);
        }

        inner.append_logs(tx.logs);
        tracing::trace!(records = stored.len(), "committed transaction");
        Ok(stored)
    }

    async fn history(&self, entity: &EntityRef) -> DbResult<Vec<TransitionRecord>> {
        self.check()?;
        let inner = self.inner.read();
        Ok(inner
            .by_entity
            .get(entity)
            .map(|indexes| indexes.iter().map(|&i| inner.audit[i].clone()).collect())
            .unwrap_or_default())
    }

    async fn run_history(&self, run_id: ResourceId) -> DbResult<Vec<TransitionRecord>> {
        self.check()?;
        let inner = self.inner.read();
        if !inner.runs.contains_key(&run_id) {
            return Err(DbError::NotFound(format!("run {}", run_id)));
        }
        Ok(inner
            .audit
            .iter()
            .filter(|r| match &r.entity {
                EntityRef::Run { id } => *id == run_id,
                EntityRef::Step { run, .. } => *run == run_id,
                EntityRef::Agent { .. } => false,
            })
            .cloned()
            .collect())
    }

    async fn audit_log(&self, after: u64, limit: usize) -> DbResult<Vec<TransitionRecord>> {
        self.check()?;
        let inner = self.inner.read();
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(inner.audit.len());
        Ok(inner.audit[start..].iter().take(limit).cloned().collect())
    }

    async fn append_logs(&self, lines: Vec<LogLine>) -> DbResult<()> {
        self.check()?;
        self.inner.write().append_logs(lines);
        Ok(())
    }

    async fn logs(
        &self,
        run_id: ResourceId,
        step: Option<usize>,
        offset: usize,
        limit: usize,
    ) -> DbResult<Vec<LogLine>> {
        self.check()?;
        let inner = self.inner.read();
        Ok(inner
            .logs
            .get(&run_id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| step.is_none_or(|s| s == l.step))
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
