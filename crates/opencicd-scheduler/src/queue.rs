//! Pending run queue.
//!
//! FIFO within a priority tier, higher tiers first. The queue is an index over PENDING runs in
//! the store and is rebuilt from it at startup, so it survives a restart without its own
//! persistence.

use chrono::{DateTime, Utc};
use opencicd_core::ResourceId;
use opencicd_core::run::Run;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// A queued run as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRun {
    pub run_id: ResourceId,
    pub priority: i32,
    pub requires: BTreeSet<String>,
    pub queued_at: DateTime<Utc>,
}

impl From<&Run> for QueuedRun {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            priority: run.priority,
            requires: run.requires.clone(),
            queued_at: run.queued_at,
        }
    }
}

#[derive(Default)]
struct Inner {
    tiers: BTreeMap<Reverse<i32>, VecDeque<QueuedRun>>,
    members: HashSet<ResourceId>,
}

#[derive(Default)]
pub struct PendingQueue {
    inner: Mutex<Inner>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the store's PENDING runs.
    pub fn restore(runs: &[Run]) -> Self {
        let mut ordered: Vec<&Run> = runs.iter().collect();
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
                .then(a.id.cmp(&b.id))
        });

        let queue = Self::new();
        for run in ordered {
            queue.push(QueuedRun::from(run));
        }
        queue
    }

    /// Append to the back of its tier. Returns false if the run is already queued.
    pub fn push(&self, entry: QueuedRun) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.insert(entry.run_id) {
            return false;
        }
        inner
            .tiers
            .entry(Reverse(entry.priority))
            .or_default()
            .push_back(entry);
        true
    }

    pub fn remove(&self, run_id: ResourceId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.remove(&run_id) {
            return false;
        }
        inner.tiers.retain(|_, tier| {
            tier.retain(|e| e.run_id != run_id);
            !tier.is_empty()
        });
        true
    }

    pub fn contains(&self, run_id: ResourceId) -> bool {
        self.inner.lock().members.contains(&run_id)
    }

    /// Queued runs in service order.
    pub fn snapshot(&self) -> Vec<QueuedRun> {
        self.inner
            .lock()
            .tiers
            .values()
            .flat_map(|tier| tier.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(priority: i32, offset_secs: i64) -> QueuedRun {
        QueuedRun {
            run_id: ResourceId::new(),
            priority,
            requires: BTreeSet::new(),
            queued_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap()
                + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_fifo_within_tier() {
        let queue = PendingQueue::new();
        let a = entry(0, 0);
        let b = entry(0, 1);
        queue.push(a.clone());
        queue.push(b.clone());

        let order: Vec<_> = queue.snapshot().into_iter().map(|e| e.run_id).collect();
        assert_eq!(order, vec![a.run_id, b.run_id]);
    }

    #[test]
    fn test_higher_priority_first() {
        let queue = PendingQueue::new();
        let low = entry(0, 0);
        let high = entry(5, 10);
        queue.push(low.clone());
        queue.push(high.clone());

        let order: Vec<_> = queue.snapshot().into_iter().map(|e| e.run_id).collect();
        assert_eq!(order, vec![high.run_id, low.run_id]);
    }

    #[test]
    fn test_push_is_idempotent() {
        let queue = PendingQueue::new();
        let a = entry(0, 0);
        assert!(queue.push(a.clone()));
        assert!(!queue.push(a.clone()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove() {
        let queue = PendingQueue::new();
        let a = entry(1, 0);
        let b = entry(1, 1);
        queue.push(a.clone());
        queue.push(b.clone());

        assert!(queue.remove(a.run_id));
        assert!(!queue.remove(a.run_id));
        assert!(!queue.contains(a.run_id));
        assert_eq!(queue.snapshot(), vec![b]);
    }

    #[test]
    fn test_empty_tiers_are_dropped() {
        let queue = PendingQueue::new();
        let a = entry(3, 0);
        queue.push(a.clone());
        queue.remove(a.run_id);
        assert!(queue.is_empty());
        assert!(queue.inner.lock().tiers.is_empty());
    }
}
