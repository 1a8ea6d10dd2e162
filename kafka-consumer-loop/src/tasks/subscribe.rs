//! §4.1 SubscribeTask: runs once at construction, on the executor task.

use crate::broker::BrokerError;
use crate::loop_runtime::LoopRuntime;
use crate::records::{PartitionSet, TopicPartition};

pub async fn run(runtime: &LoopRuntime) -> Result<(), BrokerError> {
    let manual = runtime.config.manual_partitions();
    if manual.is_empty() {
        runtime.broker.subscribe(&[runtime.config.kafka_topic.clone()]).await?;
        tracing::info!(
            topic = runtime.config.kafka_topic,
            group_id = runtime.config.kafka_group_id,
            "subscribed"
        );
    } else {
        // §4.1/§6.4: manual assignment bypasses consumer-group rebalancing entirely, so
        // `RebalanceListener`/`RebalanceCoordinator` never fire for this partition set.
        let assignment: PartitionSet = manual
            .iter()
            .map(|p| TopicPartition::new(runtime.config.kafka_topic.clone(), *p))
            .collect();
        runtime.broker.assign(&assignment).await?;
        tracing::info!(
            topic = runtime.config.kafka_topic,
            partitions = ?manual,
            "manually assigned"
        );
    }
    Ok(())
}
