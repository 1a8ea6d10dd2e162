//! `ConsumerLoop`: the public façade. Wires `LoopState`, `CommittableBatch`, the `Broker`, the
//! downstream `RecordSink` and the `LoopExecutor` together and exposes the handful of
//! thread-safe entry points external code is allowed to call (§5 "Off-executor calls permitted").

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::broker::{Broker, RebalanceCoordinator, RebalanceListener};
use crate::committable_batch::CommittableBatch;
use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::executor::{Command, ExecutorHandle, LoopExecutor, Scheduler};
use crate::records::{RecordBatch, TopicPartition};
use crate::sink::RecordSink;
use crate::state::LoopState;
use crate::tasks;

/// Everything the task bodies in `tasks/` need. Cheap to clone (all fields are `Arc`s).
#[derive(Clone)]
pub struct LoopRuntime {
    pub state: Arc<LoopState>,
    pub batch: Arc<CommittableBatch>,
    pub broker: Arc<dyn Broker>,
    pub sink: Arc<dyn RecordSink>,
    pub config: Arc<LoopConfig>,
    pub scheduler: Scheduler,
    pub health: Option<Arc<health::HealthHandle>>,
    /// A batch the sink returned `Retry` on, held here so the next `PollTask` tick re-emits the
    /// same records instead of polling the broker for new ones (§4.2).
    pub retry_batch: Arc<Mutex<Option<RecordBatch>>>,
}

/// Public handle to a running consumer loop.
pub struct ConsumerLoop {
    runtime: LoopRuntime,
    handle: ExecutorHandle,
    executor: Option<tokio::task::JoinHandle<()>>,
    periodic_commit: Option<tokio::task::JoinHandle<()>>,
}

impl ConsumerLoop {
    /// Builds the loop, runs `SubscribeTask` (§4.1) once, then starts the executor task with
    /// `PollTask` as its first scheduled command.
    pub async fn new(
        config: Arc<LoopConfig>,
        client_config: rdkafka::ClientConfig,
        sink: Arc<dyn RecordSink>,
        listener: Arc<dyn RebalanceListener>,
        health: Option<Arc<health::HealthHandle>>,
    ) -> Result<Self, LoopError> {
        let state = Arc::new(LoopState::new());
        let coordinator = Arc::new(RebalanceCoordinator::new(state.clone(), listener));
        let broker: Arc<dyn Broker> = Arc::new(crate::broker::RdKafkaBroker::new(
            client_config,
            coordinator.clone(),
        )?);

        let this = Self::assemble(config, state, broker, sink, health).await?;
        coordinator.set_runtime(this.runtime.clone());
        Ok(this)
    }

    /// Same assembly, against an arbitrary `Broker` implementation instead of `RdKafkaBroker` —
    /// used by the `tests/` scenario suite against `test_support::FakeBroker`. Skips the
    /// `RebalanceCoordinator`/`LoopContext` wiring, which is specific to `rdkafka`'s rebalance
    /// callbacks; fake-broker tests drive §4.4 behavior directly through `tasks::commit`.
    pub async fn with_broker(
        config: Arc<LoopConfig>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn RecordSink>,
        health: Option<Arc<health::HealthHandle>>,
    ) -> Result<Self, LoopError> {
        let state = Arc::new(LoopState::new());
        Self::assemble(config, state, broker, sink, health).await
    }

    async fn assemble(
        config: Arc<LoopConfig>,
        state: Arc<LoopState>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn RecordSink>,
        health: Option<Arc<health::HealthHandle>>,
    ) -> Result<Self, LoopError> {
        let batch = Arc::new(CommittableBatch::new(config.max_deferred_commits));
        let (executor, handle) = LoopExecutor::new();
        let scheduler = Scheduler::new(handle.clone());

        let runtime = LoopRuntime {
            state,
            batch,
            broker,
            sink,
            config,
            scheduler,
            health,
            retry_batch: Arc::new(Mutex::new(None)),
        };

        tasks::subscribe::run(&runtime).await?;

        let periodic_runtime = runtime.clone();
        let periodic_commit = runtime
            .scheduler
            .handle
            .schedule_periodic(runtime.config.commit_interval(), move || {
                tasks::commit::schedule_if_required(&periodic_runtime);
            });

        let dispatch_runtime = runtime.clone();
        let executor_task = tokio::spawn(async move {
            executor
                .run(move |cmd| {
                    let runtime = dispatch_runtime.clone();
                    async move { dispatch(cmd, &runtime).await }
                })
                .await;
        });

        runtime.scheduler.schedule_poll();

        Ok(Self {
            runtime,
            handle,
            executor: Some(executor_task),
            periodic_commit,
        })
    }

    /// Exposes the shared runtime for test assertions (state, batch, broker doubles).
    pub fn runtime(&self) -> &LoopRuntime {
        &self.runtime
    }

    /// Increase outstanding demand and ensure a poll is scheduled (§5).
    pub fn request(&self, n: i64) {
        self.runtime.state.requested.add(n);
        self.runtime.scheduler.schedule_poll();
        if self.runtime.state.is_paused_by_us() {
            self.runtime.broker.wakeup();
        }
    }

    /// External pause (§5): mutates `paused_by_user`; applied the next time PollTask runs.
    pub fn pause(&self, parts: impl IntoIterator<Item = TopicPartition>) {
        self.runtime.state.add_paused_by_user(parts);
        self.runtime.scheduler.schedule_poll();
    }

    pub fn resume(&self, parts: impl IntoIterator<Item = TopicPartition>) {
        self.runtime.state.remove_paused_by_user(parts);
        self.runtime.scheduler.schedule_poll();
        self.runtime.broker.wakeup();
    }

    pub fn set_awaiting_transaction(&self, value: bool) {
        self.runtime.state.set_awaiting_transaction(value);
        self.runtime.scheduler.schedule_poll();
        if !value {
            self.runtime.broker.wakeup();
        }
    }

    /// Idempotent; resolves once `CloseTask` runs on the executor (§5).
    pub async fn stop(&mut self) {
        if !self.runtime.state.deactivate() {
            if let Some(handle) = self.executor.take() {
                let _ = handle.await;
            }
            return;
        }
        if let Some(periodic) = self.periodic_commit.take() {
            periodic.abort();
        }
        self.runtime.broker.wakeup();

        let (tx, rx) = oneshot::channel();
        self.handle.send(Command::Close(tx));
        let _ = rx.await;
        if let Some(handle) = self.executor.take() {
            let _ = handle.await;
        }
    }
}

async fn dispatch(cmd: Command, runtime: &LoopRuntime) {
    match cmd {
        Command::Poll => tasks::poll::run(runtime).await,
        Command::Commit => tasks::commit::dispatch(runtime).await,
        Command::CommitSucceeded { offsets } => tasks::commit::on_success(runtime, &offsets),
        Command::CommitFailed { args, error } => tasks::commit::on_failure(runtime, args, error).await,
        Command::Close(done) => {
            tasks::close::run(runtime).await;
            let _ = done.send(());
        }
    }
}
