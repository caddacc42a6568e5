//! Per-entity locks.
//!
//! Every operation locks the entities it is about to read-modify-commit, so operations on the
//! same run or agent are linearized while unrelated entities proceed in parallel. Locks are
//! striped: two entities may share a stripe, which only costs some contention.
//!
//! An operation locks at most one run and one agent, always the run first.

use opencicd_core::{AgentId, ResourceId};
use std::hash::{DefaultHasher, Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

const STRIPES: usize = 64;

pub struct EntityLocks {
    runs: Vec<Mutex<()>>,
    agents: Vec<Mutex<()>>,
}

/// Guards held for the duration of one operation. Dropping releases them.
#[derive(Default)]
pub struct LockGuards<'a> {
    _run: Option<MutexGuard<'a, ()>>,
    _agent: Option<MutexGuard<'a, ()>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self {
            runs: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            agents: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock a run and/or an agent, in that order.
    pub async fn lock(&self, run: Option<ResourceId>, agent: Option<&AgentId>) -> LockGuards<'_> {
        let run_guard = match run {
            Some(id) => Some(self.runs[stripe(&id)].lock().await),
            None => None,
        };
        let agent_guard = match agent {
            Some(id) => Some(self.agents[stripe(id)].lock().await),
            None => None,
        };
        LockGuards {
            _run: run_guard,
            _agent: agent_guard,
        }
    }
}

impl Default for EntityLocks {
    fn default() -> Self {
        Self::new()
    }
}

fn stripe<T: Hash + ?Sized>(key: &T) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % STRIPES as u64) as usize
}
