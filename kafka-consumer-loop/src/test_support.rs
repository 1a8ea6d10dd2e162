//! In-memory test doubles for the scenario tests under `tests/`. Not `#[cfg(test)]`-gated so
//! integration tests in the separate `tests/` binary can use them too.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

use crate::broker::{Broker, BrokerError, CommitCallback, RebalanceListener};
use crate::records::{PartitionSet, RecordBatch, TopicPartition};
use crate::sink::{EmitError, EmitOutcome, RecordSink};

/// A retriable-looking error for tests (mirrors `LoopError::is_retriable_commit_error`).
pub fn retriable_commit_error() -> BrokerError {
    KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut)
}

/// A non-retriable error for tests.
pub fn fatal_commit_error() -> BrokerError {
    KafkaError::ConsumerCommit(RDKafkaErrorCode::Fatal)
}

#[derive(Default)]
struct FakeBrokerInner {
    pending_polls: VecDeque<Result<RecordBatch, BrokerError>>,
    assignment: PartitionSet,
    paused: PartitionSet,
    sync_commits: Vec<HashMap<TopicPartition, i64>>,
    async_commits: Vec<HashMap<TopicPartition, i64>>,
    commit_sync_result: Option<BrokerError>,
    /// When set, `commit_async` resolves with this error instead of delivering the callback
    /// with success; cleared after being consumed once.
    commit_async_result: Option<BrokerError>,
    closed: bool,
    wakeups: usize,
}

/// An in-memory `Broker` used by the state-machine unit tests and the `tests/` scenario suite.
/// Callers queue poll results with `push_poll` and inspect dispatched commits via
/// `sync_commits()`/`async_commits()`.
#[derive(Default)]
pub struct FakeBroker {
    inner: Mutex<FakeBrokerInner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_assignment(&self, assignment: PartitionSet) {
        self.inner.lock().unwrap().assignment = assignment;
    }

    pub fn push_poll(&self, result: Result<RecordBatch, BrokerError>) {
        self.inner.lock().unwrap().pending_polls.push_back(result);
    }

    pub fn fail_next_commit_sync(&self, err: BrokerError) {
        self.inner.lock().unwrap().commit_sync_result = Some(err);
    }

    pub fn fail_next_commit_async(&self, err: BrokerError) {
        self.inner.lock().unwrap().commit_async_result = Some(err);
    }

    pub fn sync_commits(&self) -> Vec<HashMap<TopicPartition, i64>> {
        self.inner.lock().unwrap().sync_commits.clone()
    }

    pub fn async_commits(&self) -> Vec<HashMap<TopicPartition, i64>> {
        self.inner.lock().unwrap().async_commits.clone()
    }

    pub fn paused(&self) -> PartitionSet {
        self.inner.lock().unwrap().paused.clone()
    }

    pub fn wakeups(&self) -> usize {
        self.inner.lock().unwrap().wakeups
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn subscribe(&self, _topics: &[String]) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn assign(&self, partitions: &PartitionSet) -> Result<(), BrokerError> {
        self.inner.lock().unwrap().assignment = partitions.clone();
        Ok(())
    }

    async fn poll(&self, _timeout: Duration) -> Result<RecordBatch, BrokerError> {
        let next = self.inner.lock().unwrap().pending_polls.pop_front();
        next.unwrap_or_else(|| Ok(RecordBatch::default()))
    }

    fn pause(&self, partitions: &PartitionSet) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        for tp in partitions {
            inner.paused.insert(tp.clone());
        }
        Ok(())
    }

    fn resume(&self, partitions: &PartitionSet) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.paused = inner.paused.difference(partitions);
        Ok(())
    }

    fn assignment(&self) -> Result<PartitionSet, BrokerError> {
        Ok(self.inner.lock().unwrap().assignment.clone())
    }

    async fn commit_sync(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.commit_sync_result.take() {
            return Err(err);
        }
        inner.sync_commits.push(offsets.clone());
        Ok(())
    }

    fn commit_async(&self, offsets: HashMap<TopicPartition, i64>, on_complete: CommitCallback) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.commit_async_result.take() {
            drop(inner);
            on_complete(Err(err));
            return;
        }
        inner.async_commits.push(offsets.clone());
        drop(inner);
        on_complete(Ok(offsets));
    }

    fn wakeup(&self) {
        self.inner.lock().unwrap().wakeups += 1;
    }

    async fn close(&self, _remaining: Duration) -> Result<(), BrokerError> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

/// Records every batch and error handed to it; never retries.
#[derive(Default)]
pub struct FakeSink {
    pub accepted: Mutex<Vec<RecordBatch>>,
    pub errors: AtomicUsize,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordSink for FakeSink {
    async fn emit_next(&self, batch: RecordBatch) -> EmitOutcome {
        self.accepted.lock().unwrap().push(batch);
        EmitOutcome::Accepted
    }

    async fn emit_error(&self, _err: &dyn std::error::Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// A sink that returns `EmitOutcome::Retry(batch, EmitError::Busy)` for its first `busy_for`
/// calls, then accepts. Used by the commit-retry and backpressure scenario tests.
pub struct FlakySink {
    busy_for: AtomicUsize,
    pub accepted: Mutex<Vec<RecordBatch>>,
}

impl FlakySink {
    pub fn new(busy_for: usize) -> Self {
        Self {
            busy_for: AtomicUsize::new(busy_for),
            accepted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RecordSink for FlakySink {
    async fn emit_next(&self, batch: RecordBatch) -> EmitOutcome {
        let remaining = self.busy_for.load(Ordering::SeqCst);
        if remaining > 0 {
            self.busy_for.fetch_sub(1, Ordering::SeqCst);
            return EmitOutcome::Retry(batch, EmitError::Busy);
        }
        self.accepted.lock().unwrap().push(batch);
        EmitOutcome::Accepted
    }

    async fn emit_error(&self, _err: &dyn std::error::Error) {}
}

/// Records assigned/revoked partitions for assertions.
#[derive(Default)]
pub struct FakeListener {
    pub assigned: Mutex<Vec<PartitionSet>>,
    pub revoked: Mutex<Vec<PartitionSet>>,
}

impl FakeListener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RebalanceListener for FakeListener {
    fn on_assigned(&self, assigned: &PartitionSet) {
        self.assigned.lock().unwrap().push(assigned.clone());
    }

    fn on_revoked(&self, revoked: &PartitionSet) {
        self.revoked.lock().unwrap().push(revoked.clone());
    }
}

pub fn arc_broker() -> Arc<FakeBroker> {
    Arc::new(FakeBroker::new())
}
