//! Live update fan-out.

use opencicd_core::ResourceId;
use opencicd_core::update::{RunUpdate, UpdatePublisher};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Broadcasts updates to per-run subscribers and to subscribers of every run.
///
/// Sending never waits. A subscriber that falls behind by more than the channel capacity
/// receives `RecvError::Lagged` and should resync from the run's history.
pub struct Broadcaster {
    capacity: usize,
    all: broadcast::Sender<RunUpdate>,
    runs: Mutex<HashMap<ResourceId, broadcast::Sender<RunUpdate>>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            capacity,
            all,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to one run, or to every run when `run_id` is `None`.
    pub fn subscribe(&self, run_id: Option<ResourceId>) -> broadcast::Receiver<RunUpdate> {
        match run_id {
            None => self.all.subscribe(),
            Some(id) => self
                .runs
                .lock()
                .entry(id)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
        }
    }

    pub fn subscriber_count(&self, run_id: ResourceId) -> usize {
        self.runs
            .lock()
            .get(&run_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl UpdatePublisher for Broadcaster {
    fn publish(&self, update: RunUpdate) {
        if let Some(run_id) = update.run_id() {
            let mut runs = self.runs.lock();
            if let Some(tx) = runs.get(&run_id) {
                if tx.send(update.clone()).is_err() {
                    runs.remove(&run_id);
                }
            }
        }
        // Ignore send errors (no subscribers)
        let _ = self.all.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opencicd_core::update::{LogLine, LogStream};

    fn line(run_id: ResourceId, seq: u64) -> RunUpdate {
        RunUpdate::Log(LogLine {
            run_id,
            step: 0,
            seq,
            stream: LogStream::Stdout,
            content: format!("line {seq}"),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_run_subscriber_only_sees_its_run() {
        let hub = Broadcaster::new(16);
        let mine = ResourceId::new();
        let other = ResourceId::new();
        let mut rx = hub.subscribe(Some(mine));

        hub.publish(line(other, 0));
        hub.publish(line(mine, 0));

        assert_eq!(rx.try_recv().unwrap().run_id(), Some(mine));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_global_subscriber_sees_everything() {
        let hub = Broadcaster::new(16);
        let mut rx = hub.subscribe(None);

        hub.publish(line(ResourceId::new(), 0));
        hub.publish(line(ResourceId::new(), 0));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let hub = Broadcaster::new(16);
        hub.publish(line(ResourceId::new(), 0));
    }

    #[test]
    fn test_abandoned_run_channel_is_dropped() {
        let hub = Broadcaster::new(16);
        let run = ResourceId::new();
        let rx = hub.subscribe(Some(run));
        assert_eq!(hub.subscriber_count(run), 1);
        drop(rx);

        hub.publish(line(run, 0));
        assert!(hub.runs.lock().is_empty());
    }

    #[test]
    fn test_slow_subscriber_lags_instead_of_blocking() {
        let hub = Broadcaster::new(2);
        let run = ResourceId::new();
        let mut rx = hub.subscribe(Some(run));

        for seq in 0..5 {
            hub.publish(line(run, seq));
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }
}
