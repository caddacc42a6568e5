//! Per-step log ordering.
//!
//! Agents number the fragments of each step from 0. Fragments are released strictly in that
//! order; a fragment that arrives ahead of a missing one is held back. If the hole is still
//! open after the gap window, a [`LogGap`] is released in its place and ordering resumes after
//! it.
//!
//! Sequencing is two-phase. Every operation returns a [`Release`] computed against a copy of
//! the affected streams; the sequencer itself only changes when the release is handed to
//! [`LogSequencer::settle`] after its lines were persisted. Output that fails to persist is
//! therefore offered again by the next operation on the same stream. Callers hold the run lock
//! from computing a run's release until settling it.

use chrono::{DateTime, Utc};
use opencicd_core::update::{LogGap, LogLine, LogStream};
use opencicd_core::{Error, ResourceId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Output of the sequencer, in release order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequenced {
    Line(LogLine),
    Gap(LogGap),
}

type StreamKey = (ResourceId, usize);

#[derive(Debug, Clone, Default)]
struct StepStream {
    next: u64,
    pending: BTreeMap<u64, LogLine>,
    /// When the current hole was first observed.
    waiting_since: Option<DateTime<Utc>>,
}

impl StepStream {
    fn drain(&mut self, out: &mut Vec<Sequenced>) {
        while let Some(line) = self.pending.remove(&self.next) {
            self.next += 1;
            out.push(Sequenced::Line(line));
        }
    }

    /// Release a gap for the hole in front of the first held fragment, then everything
    /// contiguous behind it.
    fn skip_hole(&mut self, key: StreamKey, now: DateTime<Utc>, out: &mut Vec<Sequenced>) {
        let Some(&first_held) = self.pending.keys().next() else {
            return;
        };
        out.push(Sequenced::Gap(LogGap {
            run_id: key.0,
            step: key.1,
            from_seq: self.next,
            to_seq: first_held - 1,
            timestamp: now,
        }));
        self.next = first_held;
        self.drain(out);
    }
}

/// Sequenced output together with the stream states it leaves behind.
#[must_use]
#[derive(Debug, Default)]
pub struct Release {
    items: Vec<Sequenced>,
    /// `None` forgets the stream.
    streams: Vec<(StreamKey, Option<StepStream>)>,
}

impl Release {
    pub fn items(&self) -> &[Sequenced] {
        &self.items
    }

    /// Lines to persist, with a marker line standing in for each gap.
    pub fn lines(&self) -> Vec<LogLine> {
        self.items
            .iter()
            .map(|item| match item {
                Sequenced::Line(line) => line.clone(),
                Sequenced::Gap(gap) => gap_marker(gap),
            })
            .collect()
    }
}

pub struct LogSequencer {
    window: Duration,
    streams: Mutex<HashMap<StreamKey, StepStream>>,
}

impl LogSequencer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Accept one fragment and return whatever became releasable.
    ///
    /// A fragment whose sequence number was already released or is already held is a
    /// duplicate and is rejected as out of order.
    pub fn accept(&self, line: LogLine, now: DateTime<Utc>) -> Result<Release> {
        if line.seq == u64::MAX {
            return Err(Error::InvalidInput(format!(
                "log fragment sequence {} out of range for step {} of run {}",
                line.seq, line.step, line.run_id
            )));
        }

        let key = (line.run_id, line.step);
        let mut stream = self.streams.lock().get(&key).cloned().unwrap_or_default();

        if line.seq < stream.next || stream.pending.contains_key(&line.seq) {
            return Err(Error::OutOfOrder(format!(
                "duplicate log fragment {} for step {} of run {}",
                line.seq, line.step, line.run_id
            )));
        }

        let mut items = Vec::new();
        stream.pending.insert(line.seq, line);
        stream.drain(&mut items);

        if stream.pending.is_empty() {
            stream.waiting_since = None;
        } else if stream.waiting_since.is_none() {
            stream.waiting_since = Some(now);
        }
        Ok(Release {
            items,
            streams: vec![(key, Some(stream))],
        })
    }

    /// Runs with a hole older than the gap window.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<ResourceId> {
        let mut runs: Vec<ResourceId> = self
            .streams
            .lock()
            .iter()
            .filter(|(_, stream)| self.is_expired(stream, now))
            .map(|(&(run_id, _), _)| run_id)
            .collect();
        runs.sort_unstable();
        runs.dedup();
        runs
    }

    /// Give up on the holes of one run that are older than the gap window.
    pub fn flush_expired(&self, run_id: ResourceId, now: DateTime<Utc>) -> Release {
        let mut release = Release::default();
        for (key, mut stream) in self.run_streams(run_id) {
            if !self.is_expired(&stream, now) {
                continue;
            }
            stream.skip_hole(key, now, &mut release.items);
            stream.waiting_since = if stream.pending.is_empty() {
                None
            } else {
                Some(now)
            };
            release.streams.push((key, Some(stream)));
        }
        release
    }

    /// Stop ordering a finished run. Held fragments are released behind gap markers for the
    /// holes in front of them.
    pub fn close(&self, run_id: ResourceId, now: DateTime<Utc>) -> Release {
        let mut release = Release::default();
        for (key, mut stream) in self.run_streams(run_id) {
            while !stream.pending.is_empty() {
                stream.skip_hole(key, now, &mut release.items);
            }
            release.streams.push((key, None));
        }
        release
    }

    /// Commit a release whose lines were persisted. Returns its items in release order.
    pub fn settle(&self, release: Release) -> Vec<Sequenced> {
        let mut streams = self.streams.lock();
        for (key, stream) in release.streams {
            match stream {
                Some(stream) => {
                    streams.insert(key, stream);
                }
                None => {
                    streams.remove(&key);
                }
            }
        }
        release.items
    }

    /// Fragments currently held back.
    pub fn held(&self) -> usize {
        self.streams.lock().values().map(|s| s.pending.len()).sum()
    }

    fn is_expired(&self, stream: &StepStream, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        stream
            .waiting_since
            .is_some_and(|since| now.signed_duration_since(since) >= window)
    }

    /// Copies of a run's streams, ordered by step.
    fn run_streams(&self, run_id: ResourceId) -> Vec<(StreamKey, StepStream)> {
        let mut streams: Vec<_> = self
            .streams
            .lock()
            .iter()
            .filter(|((run, _), _)| *run == run_id)
            .map(|(&key, stream)| (key, stream.clone()))
            .collect();
        streams.sort_unstable_by_key(|(key, _)| key.1);
        streams
    }
}

/// The line persisted in place of missing fragments.
pub fn gap_marker(gap: &LogGap) -> LogLine {
    LogLine {
        run_id: gap.run_id,
        step: gap.step,
        seq: gap.from_seq,
        stream: LogStream::System,
        content: format!("[log gap: sequence {}..={} missing]", gap.from_seq, gap.to_seq),
        timestamp: gap.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn frag(run_id: ResourceId, seq: u64) -> LogLine {
        LogLine {
            run_id,
            step: 0,
            seq,
            stream: LogStream::Stdout,
            content: format!("line {seq}"),
            timestamp: t0(),
        }
    }

    fn seqs(out: &[Sequenced]) -> Vec<u64> {
        out.iter()
            .filter_map(|s| match s {
                Sequenced::Line(l) => Some(l.seq),
                Sequenced::Gap(_) => None,
            })
            .collect()
    }

    /// Accept and settle in one go, as a caller whose persist succeeded would.
    fn feed(seq: &LogSequencer, line: LogLine) -> Result<Vec<Sequenced>> {
        Ok(seq.settle(seq.accept(line, t0())?))
    }

    #[test]
    fn test_in_order_fragments_pass_through() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        assert_eq!(seqs(&feed(&seq, frag(run, 0)).unwrap()), vec![0]);
        assert_eq!(seqs(&feed(&seq, frag(run, 1)).unwrap()), vec![1]);
    }

    #[test]
    fn test_out_of_order_fragment_is_held_until_hole_fills() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        feed(&seq, frag(run, 0)).unwrap();

        assert!(feed(&seq, frag(run, 2)).unwrap().is_empty());
        assert_eq!(seq.held(), 1);
        assert_eq!(seqs(&feed(&seq, frag(run, 1)).unwrap()), vec![1, 2]);
        assert_eq!(seq.held(), 0);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        feed(&seq, frag(run, 0)).unwrap();
        feed(&seq, frag(run, 2)).unwrap();

        let released = feed(&seq, frag(run, 0)).unwrap_err();
        assert!(released.is_ignorable());
        let held = feed(&seq, frag(run, 2)).unwrap_err();
        assert!(held.is_ignorable());
    }

    #[test]
    fn test_last_sequence_number_is_rejected() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        feed(&seq, frag(run, 0)).unwrap();

        let err = feed(&seq, frag(run, u64::MAX)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!err.is_ignorable());
        assert_eq!(seq.held(), 0);

        // The largest accepted number still closes cleanly.
        feed(&seq, frag(run, u64::MAX - 1)).unwrap();
        let out = seq.settle(seq.close(run, t0()));
        assert_eq!(seqs(&out), vec![u64::MAX - 1]);
    }

    #[test]
    fn test_unsettled_release_changes_nothing() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        feed(&seq, frag(run, 0)).unwrap();

        // Persisting this one failed, so it is never settled.
        let lost = seq.accept(frag(run, 1), t0()).unwrap();
        assert_eq!(seqs(lost.items()), vec![1]);
        drop(lost);

        assert_eq!(seqs(&feed(&seq, frag(run, 1)).unwrap()), vec![1]);
    }

    #[test]
    fn test_expired_hole_becomes_gap() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        feed(&seq, frag(run, 0)).unwrap();
        feed(&seq, frag(run, 3)).unwrap();
        feed(&seq, frag(run, 4)).unwrap();

        let early = t0() + chrono::Duration::seconds(1);
        assert!(seq.expired(early).is_empty());
        assert!(seq.flush_expired(run, early).items().is_empty());

        let late = t0() + chrono::Duration::seconds(2);
        assert_eq!(seq.expired(late), vec![run]);
        let out = seq.settle(seq.flush_expired(run, late));
        match &out[0] {
            Sequenced::Gap(gap) => {
                assert_eq!((gap.from_seq, gap.to_seq), (1, 2));
            }
            other => panic!("expected gap, got {other:?}"),
        }
        assert_eq!(seqs(&out), vec![3, 4]);
        assert!(seq.expired(late).is_empty());

        // Late arrival for the skipped range is a duplicate now.
        assert!(feed(&seq, frag(run, 1)).is_err());
        assert_eq!(seqs(&feed(&seq, frag(run, 5)).unwrap()), vec![5]);
    }

    #[test]
    fn test_unsettled_flush_is_offered_again() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        feed(&seq, frag(run, 0)).unwrap();
        feed(&seq, frag(run, 2)).unwrap();

        let late = t0() + chrono::Duration::seconds(5);
        let first = seq.flush_expired(run, late);
        assert_eq!(first.lines().len(), 2);
        drop(first);

        assert_eq!(seq.held(), 1);
        let again = seq.flush_expired(run, late);
        assert_eq!(again.lines()[0].content, "[log gap: sequence 1..=1 missing]");
        assert_eq!(seqs(&seq.settle(again)), vec![2]);
        assert_eq!(seq.held(), 0);
    }

    #[test]
    fn test_steps_are_independent() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        let mut other_step = frag(run, 0);
        other_step.step = 1;

        feed(&seq, frag(run, 1)).unwrap();
        assert_eq!(seqs(&feed(&seq, other_step).unwrap()), vec![0]);
    }

    #[test]
    fn test_gap_marker_line() {
        let gap = LogGap {
            run_id: ResourceId::new(),
            step: 2,
            from_seq: 4,
            to_seq: 6,
            timestamp: t0(),
        };
        let line = gap_marker(&gap);
        assert_eq!(line.stream, LogStream::System);
        assert_eq!(line.seq, 4);
        assert_eq!(line.content, "[log gap: sequence 4..=6 missing]");
    }

    #[test]
    fn test_close_releases_held_fragments() {
        let seq = LogSequencer::new(Duration::from_secs(2));
        let run = ResourceId::new();
        feed(&seq, frag(run, 0)).unwrap();
        feed(&seq, frag(run, 2)).unwrap();

        let out = seq.settle(seq.close(run, t0()));
        assert!(matches!(&out[0], Sequenced::Gap(g) if g.from_seq == 1 && g.to_seq == 1));
        assert_eq!(seqs(&out), vec![2]);
        assert_eq!(seq.held(), 0);

        // A closed run starts over if it ever logs again.
        assert_eq!(seqs(&feed(&seq, frag(run, 0)).unwrap()), vec![0]);
    }
}
