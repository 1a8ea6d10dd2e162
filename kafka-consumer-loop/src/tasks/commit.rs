//! §4.3 CommitTask: dispatches commits, runs the retry state machine.

use std::time::Duration;

use crate::config::AckMode;
use crate::error::LoopError;
use crate::executor::Command;
use crate::loop_runtime::LoopRuntime;

/// The core dispatch body (§4.3 steps 1-6). Idempotent: a no-op if nothing is pending.
pub async fn dispatch(runtime: &LoopRuntime) {
    if !runtime.state.take_pending() {
        return;
    }

    let Some(commit_args) = runtime.batch.get_and_clear_offsets() else {
        return;
    };

    if commit_args.offsets.is_empty() {
        on_success(runtime, &commit_args.offsets);
        return;
    }

    match runtime.config.ack_mode {
        AckMode::AtMostOnce => match runtime.broker.commit_sync(&commit_args.offsets).await {
            Ok(()) => on_success(runtime, &commit_args.offsets),
            Err(err) => on_failure(runtime, commit_args, err).await,
        },
        AckMode::ExactlyOnce => {
            // Commits are driven by the transactional producer path; nothing to do here, and
            // periodic arming is never wired up for this mode (§9 decided open question).
        }
        AckMode::AutoAck | AckMode::ManualAck => {
            let runtime2 = runtime.clone();
            let offsets_for_cb = commit_args.offsets.clone();
            runtime.broker.commit_async(
                commit_args.offsets.clone(),
                Box::new(move |result| {
                    // Runs on a broker-client thread (§5); only touch thread-safe state here and
                    // schedule the rest back onto the executor.
                    match result {
                        Ok(_) => {
                            runtime2.scheduler.handle.send(Command::CommitSucceeded {
                                offsets: offsets_for_cb,
                            });
                        }
                        Err(err) => {
                            runtime2.scheduler.handle.send(Command::CommitFailed {
                                args: crate::committable_batch::CommitArgs {
                                    offsets: offsets_for_cb,
                                },
                                error: err,
                            });
                        }
                    }
                }),
            );
            // Commit callbacks depend on poll progress in the broker client.
            runtime.scheduler.schedule_poll();
        }
    }
}

pub(crate) fn on_success(runtime: &LoopRuntime, offsets: &std::collections::HashMap<crate::records::TopicPartition, i64>) {
    if !offsets.is_empty() {
        runtime.state.reset_consecutive_failures();
        metrics::counter!("kafka_consumer_loop_commits_succeeded_total").increment(1);
    }
    if runtime.state.is_retrying() {
        runtime.state.set_retrying(false);
        runtime.scheduler.schedule_poll();
    }
}

pub(crate) async fn on_failure(
    runtime: &LoopRuntime,
    commit_args: crate::committable_batch::CommitArgs,
    err: crate::broker::BrokerError,
) {
    let attempts = runtime.state.bump_consecutive_failures();
    let retriable = LoopError::is_retriable_commit_error(&err) && attempts < runtime.config.max_commit_attempts;

    if !retriable {
        metrics::counter!("kafka_consumer_loop_commits_failed_total").increment(1);
        if runtime.state.is_retrying() {
            runtime.state.set_retrying(false);
            runtime.scheduler.schedule_poll();
        }
        runtime.batch.restore_offsets(commit_args, false);
        if runtime.state.is_active() {
            let wrapped = LoopError::CommitExhausted {
                attempts,
                source: err,
            };
            tracing::error!(%wrapped, "commit failed terminally");
            runtime.sink.emit_error(&wrapped).await;
        }
        return;
    }

    metrics::counter!("kafka_consumer_loop_commits_retried_total").increment(1);
    runtime.batch.restore_offsets(commit_args, true);
    runtime.state.force_pending();
    runtime.state.set_retrying(true);
    runtime.scheduler.schedule_poll();
    runtime
        .scheduler
        .handle
        .schedule_after(runtime.config.commit_retry_interval(), Command::Commit);
}

/// §4.3 `run_if_required`: used from PollTask, RebalanceHandler and CloseTask.
pub async fn run_if_required(runtime: &LoopRuntime, force: bool) {
    if force {
        runtime.state.force_pending();
    }
    if !runtime.state.is_retrying() && runtime.state.is_pending() {
        dispatch(runtime).await;
    }
}

/// §4.3 `schedule_if_required`: the periodic commit timer's only job.
pub fn schedule_if_required(runtime: &LoopRuntime) {
    if runtime.state.is_active() && !runtime.state.is_retrying() && runtime.state.arm_pending() {
        runtime.scheduler.handle.send(Command::Commit);
    }
}

/// §4.3 `wait_for`: only ever called from CloseTask. Drives async commit callbacks by polling
/// with a 1ms timeout until either they all land or the deadline passes.
pub async fn wait_for(runtime: &LoopRuntime, deadline: std::time::Instant) {
    while runtime.state.in_progress() > 0 && std::time::Instant::now() < deadline {
        let _ = runtime.broker.poll(Duration::from_millis(1)).await;
    }
}
