//! §4.5 CloseTask: orderly shutdown, on the executor task.

use std::time::Instant;

use crate::config::AckMode;
use crate::loop_runtime::LoopRuntime;
use crate::records::{PartitionSet, TopicPartition};
use crate::tasks::commit;

pub async fn run(runtime: &LoopRuntime) {
    if runtime.broker.is_closed() {
        return;
    }

    let deadline = Instant::now() + runtime.config.close_timeout();

    // Manual assignment (§4.1/§6.4) never triggers `ConsumerContext::pre_rebalance`, so the
    // revocation protocol that `LoopContext::handle_revoked` runs on a real rebalance has to be
    // driven explicitly here against the whole configured assignment before the consumer closes.
    let manual = runtime.config.manual_partitions();
    if !manual.is_empty() && runtime.config.ack_mode != AckMode::AtMostOnce {
        let assignment: PartitionSet = manual
            .iter()
            .map(|p| TopicPartition::new(runtime.config.kafka_topic.clone(), *p))
            .collect();
        commit::run_if_required(runtime, true).await;
        commit::wait_for(runtime, deadline).await;
        runtime.batch.partitions_revoked(&assignment);
    }

    for attempt in 0..3 {
        // §4.5 step 3: for every mode but exactly-once, `run_if_required` always runs (it is
        // itself a no-op if nothing is pending) so a commit already armed by the periodic timer
        // is not silently dropped on close; only the `forceCommit` argument varies by mode.
        if runtime.config.ack_mode != AckMode::ExactlyOnce {
            let force_commit = runtime.config.ack_mode != AckMode::AtMostOnce;
            commit::run_if_required(runtime, force_commit).await;
            commit::wait_for(runtime, deadline).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match runtime.broker.close(remaining).await {
            Ok(()) => return,
            Err(err) => {
                tracing::warn!(%err, attempt, "close attempt failed, retrying");
                if attempt == 2 {
                    if runtime.state.is_active() {
                        runtime.sink.emit_error(&err).await;
                    }
                    return;
                }
            }
        }
    }
}
