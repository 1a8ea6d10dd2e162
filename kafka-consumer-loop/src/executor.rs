//! `LoopExecutor`: the single-threaded cooperative scheduler (§2, §5). One Tokio task drains a
//! command queue FIFO; nothing here ever runs two commands concurrently. Delayed and periodic
//! work is modeled as auxiliary tasks that merely send a `Command` back into the queue at the
//! right time — they never touch the consumer themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

/// Work items the executor task processes one at a time, in order.
pub enum Command {
    Poll,
    Commit,
    /// Delivered by an async commit callback (possibly from a broker-client thread); the
    /// callback itself only decrements `in_progress` and forwards the result here so the
    /// success/failure handler logic still runs on the executor task (§5).
    CommitSucceeded {
        offsets: std::collections::HashMap<crate::records::TopicPartition, i64>,
    },
    CommitFailed {
        args: crate::committable_batch::CommitArgs,
        error: crate::broker::BrokerError,
    },
    Close(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ExecutorHandle {
    /// Non-blocking, thread-safe; one of the few call sites allowed off the executor task (§5).
    pub fn send(&self, cmd: Command) {
        let _ = self.tx.send(cmd);
    }

    /// Idempotent schedule: only sends if `scheduled` flips false->true. Callers pass their own
    /// flag (e.g. PollTask's "at most one scheduled at a time" invariant in §4.2).
    pub fn schedule_once(&self, scheduled: &std::sync::atomic::AtomicBool, cmd: Command) {
        if scheduled
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
        {
            self.send(cmd);
        }
    }

    /// Spawns a task that sleeps `delay` then sends `cmd`. Used for the commit retry timer
    /// (§9 "uses the executor's delayed-schedule facility"); never blocks the loop body itself.
    pub fn schedule_after(&self, delay: Duration, cmd: Command) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(cmd);
        });
    }

    /// Spawns a task that calls `on_tick` every `interval`, forever, until the executor drops
    /// its receiver. `on_tick`'s only job is to arm `is_pending` and, if it won the CAS, enqueue
    /// a `Command::Commit` (§4.3 `schedule_if_required`) — it must not dispatch anything itself.
    /// `interval == 0` disables periodic commits entirely (§6.4).
    pub fn schedule_periodic<F>(&self, interval: Duration, on_tick: F) -> Option<tokio::task::JoinHandle<()>>
    where
        F: Fn() + Send + 'static,
    {
        if interval.is_zero() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                on_tick();
            }
        }))
    }
}

/// Owns the receiving end; runs on its own dedicated Tokio task.
pub struct LoopExecutor {
    rx: mpsc::UnboundedReceiver<Command>,
}

impl LoopExecutor {
    pub fn new() -> (Self, ExecutorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ExecutorHandle { tx })
    }

    /// Drains commands FIFO, invoking `on_command` for each. Returns once a `Close` command has
    /// been fully handled.
    pub async fn run<F, Fut>(mut self, mut on_command: F)
    where
        F: FnMut(Command) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        while let Some(cmd) = self.rx.recv().await {
            let is_close = matches!(cmd, Command::Close(_));
            on_command(cmd).await;
            if is_close {
                break;
            }
        }
    }
}

/// Convenience bundle threaded through task bodies so they can reschedule themselves without
/// every function taking several separate arguments.
#[derive(Clone)]
pub struct Scheduler {
    pub handle: ExecutorHandle,
    pub poll_scheduled: Arc<std::sync::atomic::AtomicBool>,
}

impl Scheduler {
    pub fn new(handle: ExecutorHandle) -> Self {
        Self {
            handle,
            poll_scheduled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn schedule_poll(&self) {
        self.handle.schedule_once(&self.poll_scheduled, Command::Poll);
    }

    pub fn take_poll_scheduled(&self) {
        self.poll_scheduled
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}
