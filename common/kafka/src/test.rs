use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;

use crate::config::KafkaConfig;

/// Spins up an in-process mock broker cluster and a matching [`KafkaConfig`]
/// pointed at it. Callers are responsible for keeping the returned cluster
/// alive for as long as any client built from the config is in use.
pub fn mock_cluster() -> (MockCluster<'static, DefaultProducerContext>, KafkaConfig) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    let config = KafkaConfig {
        kafka_tls: false,
        kafka_hosts: cluster.bootstrap_servers(),
        kafka_topic_metadata_refresh_interval_ms: Some(30000),
        kafka_socket_timeout_ms: None,
        kafka_metadata_max_age_ms: None,
    };
    (cluster, config)
}
