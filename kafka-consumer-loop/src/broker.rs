//! The broker-client boundary (§6.1): a `Broker` trait abstracting over `rdkafka`'s
//! `BaseConsumer` so the rest of the crate can be exercised against a fake in tests, plus the
//! real `rdkafka`-backed implementation and its `ConsumerContext`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance as RdRebalance,
};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::ClientConfig;

use crate::records::{PartitionSet, Record, RecordBatch, TopicPartition};
use crate::state::LoopState;

pub type BrokerError = KafkaError;

/// A boxed closure run once a previously-dispatched async commit is acknowledged by the broker
/// client. Invoked off the executor task (§5 "off-executor calls permitted") — it must only
/// touch thread-safe state directly and otherwise schedule work back onto the executor.
pub type CommitCallback = Box<dyn FnOnce(Result<HashMap<TopicPartition, i64>, BrokerError>) + Send>;

/// Notified synchronously from inside a broker `poll()`, on the executor's blocking-pool thread
/// (§4.1, §4.4). Implementations must tolerate re-entrant calls into `Broker` methods — they run
/// with exclusive, confined consumer access.
pub trait RebalanceListener: Send + Sync {
    fn on_assigned(&self, _assigned: &PartitionSet) {}
    fn on_revoked(&self, _revoked: &PartitionSet) {}
}

/// §6.1: the subset of broker-consumer operations the core needs, abstracted for testability.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;
    async fn assign(&self, partitions: &PartitionSet) -> Result<(), BrokerError>;
    async fn poll(&self, timeout: Duration) -> Result<RecordBatch, BrokerError>;
    fn pause(&self, partitions: &PartitionSet) -> Result<(), BrokerError>;
    fn resume(&self, partitions: &PartitionSet) -> Result<(), BrokerError>;
    fn assignment(&self) -> Result<PartitionSet, BrokerError>;
    async fn commit_sync(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<(), BrokerError>;
    fn commit_async(&self, offsets: HashMap<TopicPartition, i64>, on_complete: CommitCallback);
    /// Thread-safe; the only off-executor call besides `close` (§6.1).
    fn wakeup(&self);
    async fn close(&self, remaining: Duration) -> Result<(), BrokerError>;
    fn is_closed(&self) -> bool;
}

/// Shared between `LoopContext` (the `ConsumerContext`, invoked synchronously by `librdkafka`
/// from inside `poll()`) and `RdKafkaBroker` (invoked from the executor task via
/// `spawn_blocking`). Both sides need the same `LoopState` and the same rebalance listener so the
/// rebalance hooks in §4.1/§4.4 can pause/resume/commit with exclusive consumer access.
pub struct RebalanceCoordinator {
    pub state: Arc<LoopState>,
    pub listener: Arc<dyn RebalanceListener>,
    pending_commits: Mutex<std::collections::VecDeque<CommitCallback>>,
    /// Set once, after `ConsumerLoop::new` has built the full runtime (§4.4 needs `batch`,
    /// `config` and the commit task, none of which exist yet when the coordinator itself is
    /// constructed — the broker and context have to come first).
    runtime: OnceLock<crate::loop_runtime::LoopRuntime>,
}

impl RebalanceCoordinator {
    pub fn new(state: Arc<LoopState>, listener: Arc<dyn RebalanceListener>) -> Self {
        Self {
            state,
            listener,
            pending_commits: Mutex::new(std::collections::VecDeque::new()),
            runtime: OnceLock::new(),
        }
    }

    pub fn set_runtime(&self, runtime: crate::loop_runtime::LoopRuntime) {
        let _ = self.runtime.set(runtime);
    }

    fn push_pending_commit(&self, cb: CommitCallback) {
        self.pending_commits.lock().unwrap().push_back(cb);
    }

    fn pop_pending_commit(&self) -> Option<CommitCallback> {
        self.pending_commits.lock().unwrap().pop_front()
    }
}

/// `ConsumerContext` implementation. Holds a weak back-reference to the consumer it's attached
/// to so the rebalance callback can pause newly-assigned partitions directly — set once, right
/// after `create_with_context` (see `RdKafkaBroker::new`).
pub struct LoopContext {
    coordinator: Arc<RebalanceCoordinator>,
    consumer: OnceLock<Weak<BaseConsumer<LoopContext>>>,
}

impl LoopContext {
    fn new(coordinator: Arc<RebalanceCoordinator>) -> Self {
        Self {
            coordinator,
            consumer: OnceLock::new(),
        }
    }

    fn consumer(&self) -> Option<Arc<BaseConsumer<LoopContext>>> {
        self.consumer.get().and_then(Weak::upgrade)
    }
}

impl ClientContext for LoopContext {}

impl ConsumerContext for LoopContext {
    fn pre_rebalance(&self, rebalance: &RdRebalance) {
        if let RdRebalance::Revoke(tpl) = rebalance {
            let revoked = PartitionSet::from_tpl(tpl);
            tracing::info!(count = revoked.len(), "rebalance: partitions revoked");
            self.handle_revoked(revoked);
        }
    }

    fn post_rebalance(&self, rebalance: &RdRebalance) {
        if let RdRebalance::Assign(tpl) = rebalance {
            let assigned = PartitionSet::from_tpl(tpl);
            tracing::info!(count = assigned.len(), "rebalance: partitions assigned");
            self.handle_assigned(assigned);
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        let mapped: HashMap<TopicPartition, i64> = offsets
            .elements()
            .iter()
            .filter_map(|el| el.offset().to_raw().map(|o| (TopicPartition::new(el.topic(), el.partition()), o)))
            .collect();

        self.coordinator.state.decr_in_progress();
        if let Some(cb) = self.coordinator.pop_pending_commit() {
            match result {
                Ok(()) => cb(Ok(mapped)),
                Err(err) => cb(Err(err)),
            }
        }
    }
}

impl LoopContext {
    /// §4.1 assignment hook contract.
    fn handle_assigned(&self, assigned: PartitionSet) {
        let Some(consumer) = self.consumer() else {
            return;
        };

        if self.coordinator.state.is_paused_by_us() && !assigned.is_empty() {
            if let Err(err) = consumer.pause(&assigned.to_tpl()) {
                tracing::warn!(%err, "failed to pause newly assigned partitions");
            }
        }

        let paused_by_user = self.coordinator.state.paused_by_user_set();
        let to_pause: PartitionSet = assigned
            .iter()
            .filter(|tp| paused_by_user.contains(tp))
            .cloned()
            .collect();
        if !to_pause.is_empty() {
            if let Err(err) = consumer.pause(&to_pause.to_tpl()) {
                tracing::warn!(%err, "failed to pause user-paused partitions after assignment");
            }
        }

        self.coordinator
            .state
            .retain_paused_by_user(|tp| assigned.contains(tp));

        self.coordinator.listener.on_assigned(&assigned);
    }

    /// §4.4 revocation hook contract. Runs synchronously on whatever blocking-pool thread is
    /// executing `poll()`, so a nested `block_on` to drive the async commit dispatch (and a
    /// real `thread::sleep` for the drain wait) are both safe here — no other executor work is
    /// in flight while this runs.
    fn handle_revoked(&self, revoked: PartitionSet) {
        let Some(runtime) = self.coordinator.runtime.get() else {
            self.coordinator.listener.on_revoked(&revoked);
            return;
        };

        use crate::config::AckMode;

        if revoked.is_empty() || runtime.config.ack_mode == AckMode::AtMostOnce {
            self.coordinator.listener.on_revoked(&revoked);
            return;
        }

        let handle = tokio::runtime::Handle::current();
        handle.block_on(crate::tasks::commit::run_if_required(runtime, true));

        let max_delay = runtime.config.max_delay_rebalance();
        if runtime.state.is_active() && !max_delay.is_zero() {
            let start = std::time::Instant::now();
            let mut in_pipeline = runtime.batch.in_pipeline();
            while (in_pipeline > 0 || runtime.state.is_awaiting_transaction())
                && runtime.state.is_active()
                && start.elapsed() < max_delay
            {
                std::thread::sleep(runtime.config.commit_interval_during_delay());
                handle.block_on(crate::tasks::commit::run_if_required(runtime, true));
                in_pipeline = runtime.batch.in_pipeline();
            }
            metrics::histogram!("kafka_consumer_loop_rebalance_drain_duration_seconds")
                .record(start.elapsed().as_secs_f64());
        }

        runtime.batch.partitions_revoked(&revoked);
        self.coordinator.listener.on_revoked(&revoked);
    }
}

/// `rdkafka`-backed `Broker`. All blocking calls run inside `tokio::task::spawn_blocking`; the
/// caller (executor) always awaits them to completion before issuing the next one (§9).
pub struct RdKafkaBroker {
    consumer: Arc<BaseConsumer<LoopContext>>,
    closed: AtomicBool,
}

impl RdKafkaBroker {
    pub fn new(
        client_config: ClientConfig,
        coordinator: Arc<RebalanceCoordinator>,
    ) -> Result<Self, BrokerError> {
        let context = LoopContext::new(coordinator);
        let consumer: Arc<BaseConsumer<LoopContext>> =
            Arc::new(client_config.create_with_context(context)?);
        let weak = Arc::downgrade(&consumer);
        // `context()` returns the context we installed; `OnceLock::set` fails only if already
        // set, which cannot happen since this runs exactly once per broker.
        let _ = consumer.context().consumer.set(weak);
        Ok(Self {
            consumer,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Broker for RdKafkaBroker {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let topics: Vec<String> = topics.to_vec();
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&refs)
        })
        .await
        .expect("subscribe task panicked")
    }

    async fn assign(&self, partitions: &PartitionSet) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let tpl = partitions.to_tpl();
        tokio::task::spawn_blocking(move || consumer.assign(&tpl))
            .await
            .expect("assign task panicked")
    }

    async fn poll(&self, timeout: Duration) -> Result<RecordBatch, BrokerError> {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || {
            let mut records = Vec::new();
            match consumer.poll(timeout) {
                Some(Ok(msg)) => records.push(Record::from_borrowed(&msg)),
                Some(Err(err)) => return Err(err),
                None => return Ok(RecordBatch { records }),
            }
            // Drain whatever else is immediately available without blocking further, so one
            // poll timeout can yield more than one message per batch.
            while let Some(next) = consumer.poll(Duration::from_millis(0)) {
                match next {
                    Ok(msg) => records.push(Record::from_borrowed(&msg)),
                    Err(_) => break,
                }
            }
            Ok(RecordBatch { records })
        })
        .await
        .expect("poll task panicked")
    }

    fn pause(&self, partitions: &PartitionSet) -> Result<(), BrokerError> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer.pause(&partitions.to_tpl())
    }

    fn resume(&self, partitions: &PartitionSet) -> Result<(), BrokerError> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer.resume(&partitions.to_tpl())
    }

    fn assignment(&self) -> Result<PartitionSet, BrokerError> {
        self.consumer.assignment().map(|tpl| PartitionSet::from_tpl(&tpl))
    }

    async fn commit_sync(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let mut tpl = TopicPartitionList::new();
        for (tp, offset) in offsets {
            tpl.add_partition_offset(&tp.topic, tp.partition, rdkafka::Offset::Offset(*offset))
                .map_err(|_| KafkaError::OffsetFetch(rdkafka::types::RDKafkaErrorCode::InvalidArgument))?;
        }
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .expect("commit_sync task panicked")
    }

    fn commit_async(&self, offsets: HashMap<TopicPartition, i64>, on_complete: CommitCallback) {
        let mut tpl = TopicPartitionList::new();
        for (tp, offset) in &offsets {
            let _ = tpl.add_partition_offset(&tp.topic, tp.partition, rdkafka::Offset::Offset(*offset));
        }
        self.consumer.context().coordinator.push_pending_commit(on_complete);
        self.consumer.context().coordinator.state.incr_in_progress();
        if let Err(err) = self.consumer.commit(&tpl, CommitMode::Async) {
            // Dispatch itself failed synchronously; the callback will never fire, so resolve it
            // here and undo the in_progress bump.
            self.consumer.context().coordinator.state.decr_in_progress();
            if let Some(cb) = self.consumer.context().coordinator.pop_pending_commit() {
                cb(Err(err));
            }
        }
    }

    fn wakeup(&self) {
        // `BaseConsumer` exposes no public interrupt; a long poll is bounded by its own
        // `poll_timeout` and the next tick re-reads demand/pause state, which is what every
        // caller of `wakeup` actually needs (§5 treats this as best-effort, not a hard cutoff).
    }

    async fn close(&self, remaining: Duration) -> Result<(), BrokerError> {
        let _ = remaining;
        self.closed.store(true, Ordering::SeqCst);
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.unsubscribe())
            .await
            .expect("close task panicked");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
