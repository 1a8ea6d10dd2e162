//! `CommittableBatch`: the §6.3 contract. Tracks per-partition out-of-order acknowledgement so
//! the commit offset advances correctly even when downstream acks batches out of delivery order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::records::{RecordBatch, TopicPartition};

/// Per-partition tracking: the next offset we're allowed to commit, plus the set of offsets that
/// have been acked but are still above that boundary (out-of-order acks).
#[derive(Debug, Default)]
struct PartitionProgress {
    next_offset_to_commit: i64,
    acked: BTreeSet<i64>,
    in_pipeline: usize,
    /// Set once an ack has actually advanced `next_offset_to_commit` past its seed value;
    /// distinguishes "nothing acked yet" from "acked up through here already".
    advanced: bool,
    /// The `next_offset_to_commit` value already handed out by the most recent
    /// `get_and_clear_offsets` snapshot, or `None` if nothing has been dispatched (or it was
    /// put back by `restore_offsets`).
    dispatched_offset: Option<i64>,
}

/// A snapshot of offsets ready to commit, taken atomically off the batch.
#[derive(Debug, Clone, Default)]
pub struct CommitArgs {
    pub offsets: HashMap<TopicPartition, i64>,
}

#[derive(Default)]
struct Inner {
    partitions: HashMap<TopicPartition, PartitionProgress>,
    deferred_count: usize,
}

/// Accumulates uncommitted offsets across batches in flight to the downstream sink.
pub struct CommittableBatch {
    inner: Mutex<Inner>,
    out_of_order_commits: bool,
}

impl CommittableBatch {
    pub fn new(max_deferred_commits: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            out_of_order_commits: max_deferred_commits > 0,
        }
    }

    pub fn out_of_order_commits(&self) -> bool {
        self.out_of_order_commits
    }

    /// Register a batch of records as "in pipeline" (emitted downstream, not yet acked).
    pub fn add_uncommitted(&self, batch: &RecordBatch) {
        let mut inner = self.inner.lock().unwrap();
        for record in &batch.records {
            let progress = inner
                .partitions
                .entry(record.partition.clone())
                .or_insert_with(|| PartitionProgress {
                    next_offset_to_commit: record.offset,
                    ..Default::default()
                });
            progress.in_pipeline += 1;
        }
        inner.deferred_count += batch.len();
    }

    /// Downstream has finished with one record; commit eligibility advances if this closes a gap.
    pub fn ack(&self, partition: &TopicPartition, offset: i64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(progress) = inner.partitions.get_mut(partition) else {
            return;
        };
        progress.in_pipeline = progress.in_pipeline.saturating_sub(1);
        if inner.deferred_count > 0 {
            inner.deferred_count -= 1;
        }

        progress.acked.insert(offset);
        while progress.acked.contains(&progress.next_offset_to_commit) {
            progress.acked.remove(&progress.next_offset_to_commit);
            progress.next_offset_to_commit += 1;
            progress.advanced = true;
        }
    }

    /// Release pipeline/deferred-count accounting for a record that will never be acked (a
    /// terminal emit failure, §4.2) without advancing the commit offset — that record's offset
    /// is simply never committed.
    pub fn abandon_one(&self, partition: &TopicPartition) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(progress) = inner.partitions.get_mut(partition) {
            progress.in_pipeline = progress.in_pipeline.saturating_sub(1);
        }
        if inner.deferred_count > 0 {
            inner.deferred_count -= 1;
        }
    }

    /// Total records acknowledged by downstream but not yet committed, or still being processed.
    pub fn in_pipeline(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.partitions.values().map(|p| p.in_pipeline).sum()
    }

    /// Backpressure gate input: records contributing to deferred-commit pressure.
    pub fn deferred_count(&self) -> usize {
        self.inner.lock().unwrap().deferred_count
    }

    /// Atomic snapshot-and-reset of committable offsets: only partitions whose commit boundary
    /// has advanced since the last snapshot are included, and each included partition is marked
    /// dispatched so an unchanged boundary is not resent on the next call (§6.3).
    pub fn get_and_clear_offsets(&self) -> Option<CommitArgs> {
        let mut inner = self.inner.lock().unwrap();
        let mut offsets = HashMap::new();
        for (tp, progress) in inner.partitions.iter_mut() {
            if progress.advanced && progress.dispatched_offset != Some(progress.next_offset_to_commit) {
                offsets.insert(tp.clone(), progress.next_offset_to_commit);
                progress.dispatched_offset = Some(progress.next_offset_to_commit);
            }
        }
        drop(inner);
        if offsets.is_empty() {
            None
        } else {
            Some(CommitArgs { offsets })
        }
    }

    /// Put offsets back after a failed commit dispatch so they are eligible for the next
    /// `get_and_clear_offsets` snapshot again. `retry=false` surrenders them permanently (they
    /// were already communicated to the failed emitter callbacks).
    pub fn restore_offsets(&self, args: CommitArgs, retry: bool) {
        if !retry {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for (tp, offset) in args.offsets {
            if let Some(progress) = inner.partitions.get_mut(&tp) {
                if progress.dispatched_offset == Some(offset) {
                    progress.dispatched_offset = None;
                }
            }
        }
    }

    /// Drop bookkeeping for partitions we no longer own (§6.3).
    pub fn partitions_revoked(&self, revoked: &crate::records::PartitionSet) {
        let mut inner = self.inner.lock().unwrap();
        for tp in revoked {
            inner.partitions.remove(tp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Record;

    fn record(partition: i32, offset: i64) -> Record {
        Record {
            partition: TopicPartition::new("t", partition),
            offset,
            timestamp_millis: None,
            key: None,
            payload: None,
            headers: vec![],
        }
    }

    #[test]
    fn snapshot_advances_past_contiguous_acks() {
        let batch = CommittableBatch::new(0);
        let rb = RecordBatch {
            records: vec![record(0, 0), record(0, 1), record(0, 2)],
        };
        batch.add_uncommitted(&rb);
        let tp = TopicPartition::new("t", 0);
        batch.ack(&tp, 0);
        batch.ack(&tp, 1);
        batch.ack(&tp, 2);

        let args = batch.get_and_clear_offsets().unwrap();
        assert_eq!(args.offsets.get(&tp), Some(&3));
        assert_eq!(batch.in_pipeline(), 0);
    }

    #[test]
    fn out_of_order_ack_defers_until_gap_closes() {
        let batch = CommittableBatch::new(5);
        let rb = RecordBatch {
            records: vec![record(0, 0), record(0, 1), record(0, 2)],
        };
        batch.add_uncommitted(&rb);
        let tp = TopicPartition::new("t", 0);
        batch.ack(&tp, 2);
        batch.ack(&tp, 1);
        assert!(batch.get_and_clear_offsets().is_none());

        batch.ack(&tp, 0);
        let args = batch.get_and_clear_offsets().unwrap();
        assert_eq!(args.offsets.get(&tp), Some(&3));
    }

    #[test]
    fn restore_after_retry_keeps_offset_for_next_attempt() {
        let batch = CommittableBatch::new(0);
        let rb = RecordBatch {
            records: vec![record(0, 0)],
        };
        batch.add_uncommitted(&rb);
        let tp = TopicPartition::new("t", 0);
        batch.ack(&tp, 0);
        let args = batch.get_and_clear_offsets().unwrap();
        batch.restore_offsets(args, true);

        let args = batch.get_and_clear_offsets().unwrap();
        assert_eq!(args.offsets.get(&tp), Some(&1));
    }

    #[test]
    fn unchanged_boundary_is_not_resent() {
        let batch = CommittableBatch::new(0);
        let rb = RecordBatch {
            records: vec![record(0, 0)],
        };
        batch.add_uncommitted(&rb);
        let tp = TopicPartition::new("t", 0);
        batch.ack(&tp, 0);

        assert!(batch.get_and_clear_offsets().is_some());
        // No new acks since the last snapshot; nothing new to commit.
        assert!(batch.get_and_clear_offsets().is_none());
    }

    #[test]
    fn abandoned_record_releases_deferred_count_without_advancing_offset() {
        let batch = CommittableBatch::new(5);
        let rb = RecordBatch {
            records: vec![record(0, 0)],
        };
        batch.add_uncommitted(&rb);
        let tp = TopicPartition::new("t", 0);

        assert_eq!(batch.deferred_count(), 1);
        batch.abandon_one(&tp);
        assert_eq!(batch.deferred_count(), 0);
        assert_eq!(batch.in_pipeline(), 0);
        // Never acked, so there's nothing eligible to commit.
        assert!(batch.get_and_clear_offsets().is_none());
    }
}
