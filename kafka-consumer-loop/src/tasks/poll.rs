//! §4.2 PollTask: the core loop iteration, on the executor task.

use crate::loop_runtime::LoopRuntime;
use crate::tasks::commit;

pub async fn run(runtime: &LoopRuntime) {
    // §4.2 entry invariant: clear the flag first so a `schedule_poll()` racing in while this
    // tick runs (e.g. from `request()`) is not silently dropped.
    runtime.scheduler.take_poll_scheduled();

    if !runtime.state.is_active() {
        return;
    }

    if let Some(health) = &runtime.health {
        health.report_healthy().await;
    }

    // Step 2: opportunistically run a due commit before polling again.
    commit::run_if_required(runtime, false).await;

    // Step 3: effective demand.
    let mut effective = runtime.state.requested.get();
    let max_deferred = runtime.config.max_deferred_commits;
    if max_deferred > 0 && runtime.batch.deferred_count() >= max_deferred {
        effective = 0;
    }
    if runtime.state.is_retrying() {
        effective = 0;
    }

    // Step 4: pause/resume decision.
    let assignment = runtime.broker.assignment().unwrap_or_default();
    if effective > 0 && !runtime.state.is_awaiting_transaction() {
        if runtime.state.clear_paused_by_us() {
            let paused_by_user = runtime.state.paused_by_user_set();
            let resume_target = assignment
                .iter()
                .filter(|tp| !paused_by_user.contains(tp))
                .cloned()
                .collect();
            if let Err(err) = runtime.broker.resume(&resume_target) {
                tracing::warn!(%err, "failed to resume partitions");
            } else {
                metrics::counter!("kafka_consumer_loop_resumes_total").increment(1);
            }
        }
    } else {
        let reason = if effective == 0 && runtime.state.is_retrying() {
            "retrying"
        } else if effective == 0 {
            "backpressure or deferred-commit gate"
        } else {
            "awaiting transaction"
        };
        let transitioned = runtime.state.enter_paused_by_us();
        if !assignment.is_empty() {
            if let Err(err) = runtime.broker.pause(&assignment) {
                tracing::warn!(%err, "failed to pause partitions ({reason})");
            } else if transitioned {
                metrics::counter!("kafka_consumer_loop_pauses_total").increment(1);
            }
        }
        if transitioned && runtime.state.requested.get() > 0 && !runtime.state.is_retrying() {
            // Edge-triggered recheck: demand may have arrived between reading `effective` and
            // installing the pause. Force a prompt re-poll so it isn't lost (§9).
            runtime.broker.wakeup();
        }
        tracing::debug!(reason, "paused");
    }

    // Step 5: a batch the sink previously asked us to retry takes priority over a fresh poll, so
    // it is resent rather than silently dropped in favor of newer records (§4.2).
    let retried = runtime.retry_batch.lock().unwrap().take();
    let is_retry = retried.is_some();
    let poll_result = match retried {
        Some(batch) => Ok(batch),
        None => runtime.broker.poll(runtime.config.poll_timeout()).await,
    };

    // Step 6: reschedule before handling this batch, keeping the loop cooperative with commits
    // and shutdown (a subsequent tick runs the next iteration, not a tail call).
    if runtime.state.is_active() {
        runtime.scheduler.schedule_poll();
    }

    match poll_result {
        Ok(record_batch) => {
            if !record_batch.is_empty() {
                if !is_retry {
                    runtime.batch.add_uncommitted(&record_batch);
                    runtime.state.requested.decrement_one();
                }

                let acks: Vec<_> = record_batch
                    .records
                    .iter()
                    .map(|r| (r.partition.clone(), r.offset))
                    .collect();
                let record_count = record_batch.len();

                match runtime.sink.emit_next(record_batch).await {
                    crate::sink::EmitOutcome::Accepted => {
                        for (partition, offset) in acks {
                            runtime.batch.ack(&partition, offset);
                        }
                        metrics::counter!("kafka_consumer_loop_batches_emitted_total").increment(1);
                        metrics::counter!("kafka_consumer_loop_messages_emitted_total")
                            .increment(record_count as u64);
                        runtime.scheduler.schedule_poll();
                    }
                    outcome @ crate::sink::EmitOutcome::Retry(..) => {
                        if crate::sink::should_retry(runtime.state.is_active(), &outcome) {
                            if let crate::sink::EmitOutcome::Retry(batch, err) = outcome {
                                tracing::debug!(%err, "downstream sink busy, retrying same batch");
                                *runtime.retry_batch.lock().unwrap() = Some(batch);
                                runtime.scheduler.schedule_poll();
                            }
                        }
                    }
                    crate::sink::EmitOutcome::Failed(err) => {
                        for (partition, _offset) in &acks {
                            runtime.batch.abandon_one(partition);
                        }
                        if runtime.state.is_active() {
                            tracing::error!(%err, "downstream emission failed");
                            runtime.sink.emit_error(&err).await;
                        }
                    }
                }
            }
        }
        Err(err) => {
            if runtime.state.is_active() {
                tracing::error!(%err, "poll failed");
                runtime.sink.emit_error(&err).await;
            }
        }
    }
}
