//! The downstream sink contract (§6.2). The loop forwards opaque record batches and terminal
//! errors; retries are honored only for the transient, "non-serialized" failure kind.

use async_trait::async_trait;

use crate::records::RecordBatch;

/// Why an emission did not complete.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// The downstream is momentarily unable to accept more work (e.g. its own queue is full).
    /// Transient; eligible for retry while the loop is still active.
    #[error("downstream sink busy")]
    Busy,

    /// Any other failure; never retried by the loop.
    #[error("downstream sink error: {0}")]
    Other(String),
}

/// What the sink decided to do with a batch.
#[derive(Debug)]
pub enum EmitOutcome {
    Accepted,
    /// Hands the batch back unconsumed so `PollTask` can retry the exact same emission (§4.2)
    /// instead of requesting a fresh one and losing these records.
    Retry(RecordBatch, EmitError),
    Failed(EmitError),
}

/// Downstream consumer of record batches. Implementations must be safe to call from the
/// executor task; the trait itself does not assume anything about their internal concurrency.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit_next(&self, batch: RecordBatch) -> EmitOutcome;

    /// A terminal, non-recoverable error from elsewhere in the loop (poll, commit, close).
    async fn emit_error(&self, err: &dyn std::error::Error);
}

/// Policy from §4.2: retry iff the loop is still active and the failure is the transient kind.
pub fn should_retry(active: bool, outcome: &EmitOutcome) -> bool {
    matches!(
        (active, outcome),
        (true, EmitOutcome::Retry(_, EmitError::Busy))
    )
}
