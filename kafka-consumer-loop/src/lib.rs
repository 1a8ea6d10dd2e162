pub mod broker;
pub mod committable_batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod loop_runtime;
pub mod records;
pub mod sink;
pub mod sink_http;
pub mod state;
pub mod tasks;

pub mod test_support;

pub use broker::{Broker, BrokerError, RebalanceListener};
pub use config::{AckMode, LoopConfig};
pub use error::LoopError;
pub use loop_runtime::ConsumerLoop;
pub use records::{PartitionSet, Record, RecordBatch, TopicPartition};
pub use sink::{EmitError, EmitOutcome, RecordSink};
