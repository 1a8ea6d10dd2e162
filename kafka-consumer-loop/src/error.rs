use thiserror::Error;

use crate::sink::EmitError;

/// Error kinds surfaced by the loop (§7). `Wakeup` is deliberately absent: it is normal
/// control flow and is folded into an empty poll result before it ever reaches this type.
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("broker error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),

    #[error("commit failed after {attempts} attempts: {source}")]
    CommitExhausted {
        attempts: usize,
        source: rdkafka::error::KafkaError,
    },

    #[error("downstream emission failed: {0}")]
    Emission(#[from] EmitError),

    #[error("close failed: {0}")]
    Close(rdkafka::error::KafkaError),

    #[error("configuration error: {0}")]
    Config(#[from] envconfig::Error),
}

impl LoopError {
    /// Whether a broker error is worth retrying a commit for (§4.3 `is_retriable`).
    pub fn is_retriable_commit_error(err: &rdkafka::error::KafkaError) -> bool {
        use rdkafka::error::KafkaError;
        use rdkafka::types::RDKafkaErrorCode;

        match err {
            KafkaError::ConsumerCommit(code) => !matches!(
                code,
                RDKafkaErrorCode::Fatal
                    | RDKafkaErrorCode::Authentication
                    | RDKafkaErrorCode::Authorization
                    | RDKafkaErrorCode::InvalidCommitOffsetSize
                    | RDKafkaErrorCode::UnknownMemberId
            ),
            KafkaError::MessageConsumption(_) => true,
            _ => false,
        }
    }
}
