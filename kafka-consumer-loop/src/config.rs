use std::str::FromStr;

use envconfig::Envconfig;

pub use common_kafka::config::KafkaConfig;

/// §6.4 `ack_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    AtMostOnce,
    ExactlyOnce,
    AutoAck,
    ManualAck,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "at_most_once" | "at-most-once" => Ok(Self::AtMostOnce),
            "exactly_once" | "exactly-once" => Ok(Self::ExactlyOnce),
            "auto_ack" | "auto-ack" => Ok(Self::AutoAck),
            "manual_ack" | "manual-ack" => Ok(Self::ManualAck),
            other => Err(format!("unknown ack mode: {other}")),
        }
    }
}

/// Every gate and timeout named in §6.4, layered on `common_kafka::config::KafkaConfig`.
#[derive(Envconfig, Clone)]
pub struct LoopConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "KAFKA_TOPIC", default = "events_plugin_ingestion")]
    pub kafka_topic: String,

    #[envconfig(from = "KAFKA_GROUP_ID", default = "kafka-consumer-loop")]
    pub kafka_group_id: String,

    #[envconfig(from = "POLL_TIMEOUT_MS", default = "250")]
    pub poll_timeout_ms: u64,

    /// 0 disables periodic commit.
    #[envconfig(from = "COMMIT_INTERVAL_MS", default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(from = "COMMIT_RETRY_INTERVAL_MS", default = "500")]
    pub commit_retry_interval_ms: u64,

    #[envconfig(from = "MAX_COMMIT_ATTEMPTS", default = "5")]
    pub max_commit_attempts: usize,

    /// 0 disables the deferred-commit gate.
    #[envconfig(from = "MAX_DEFERRED_COMMITS", default = "0")]
    pub max_deferred_commits: usize,

    /// 0 disables the rebalance drain.
    #[envconfig(from = "MAX_DELAY_REBALANCE_MS", default = "5000")]
    pub max_delay_rebalance_ms: u64,

    #[envconfig(from = "COMMIT_INTERVAL_DURING_DELAY_MS", default = "100")]
    pub commit_interval_during_delay_ms: u64,

    #[envconfig(from = "CLOSE_TIMEOUT_MS", default = "10000")]
    pub close_timeout_ms: u64,

    #[envconfig(from = "ACK_MODE", default = "auto_ack")]
    pub ack_mode: AckMode,

    #[envconfig(from = "BIND_HOST", default = "::")]
    pub bind_host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub bind_port: u16,

    /// Where the default HTTP JSON sink forwards record batches (binary entry point only; the
    /// core loop is agnostic to the sink implementation, see §6.2).
    #[envconfig(from = "EMIT_ENDPOINT", default = "http://localhost:8000/ingest")]
    pub emit_endpoint: String,

    #[envconfig(from = "EMIT_TIMEOUT_MS", default = "5000")]
    pub emit_timeout_ms: u64,

    /// Comma-separated partition numbers to manually `assign` on `kafka_topic` instead of
    /// joining the consumer group via `subscribe` (§4.1, §6.4). Empty selects the default
    /// group-managed subscription.
    #[envconfig(from = "KAFKA_ASSIGN_PARTITIONS", default = "")]
    pub assign_partitions: String,
}

impl LoopConfig {
    pub fn poll_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn commit_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.commit_interval_ms)
    }

    pub fn commit_retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.commit_retry_interval_ms)
    }

    pub fn max_delay_rebalance(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_delay_rebalance_ms)
    }

    pub fn commit_interval_during_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.commit_interval_during_delay_ms)
    }

    pub fn close_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.close_timeout_ms)
    }

    pub fn emit_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.emit_timeout_ms)
    }

    /// Parsed `assign_partitions`; empty means "use `subscribe`, not manual assignment".
    pub fn manual_partitions(&self) -> Vec<i32> {
        self.assign_partitions
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<i32>().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_mode_parses_common_spellings() {
        assert_eq!(AckMode::from_str("auto_ack").unwrap(), AckMode::AutoAck);
        assert_eq!(AckMode::from_str("at-most-once").unwrap(), AckMode::AtMostOnce);
        assert!(AckMode::from_str("bogus").is_err());
    }

    #[test]
    fn durations_convert_from_millis() {
        let (_cluster, kafka) = common_kafka::test::mock_cluster();
        let config = LoopConfig {
            kafka,
            kafka_topic: "t".into(),
            kafka_group_id: "g".into(),
            poll_timeout_ms: 250,
            commit_interval_ms: 5000,
            commit_retry_interval_ms: 500,
            max_commit_attempts: 5,
            max_deferred_commits: 0,
            max_delay_rebalance_ms: 5000,
            commit_interval_during_delay_ms: 100,
            close_timeout_ms: 10000,
            ack_mode: AckMode::AutoAck,
            bind_host: "::".into(),
            bind_port: 3310,
            emit_endpoint: "http://localhost:8000/ingest".into(),
            emit_timeout_ms: 5000,
            assign_partitions: String::new(),
        };
        assert_eq!(config.poll_timeout(), std::time::Duration::from_millis(250));
        assert_eq!(config.close_timeout(), std::time::Duration::from_secs(10));
    }

    #[test]
    fn manual_partitions_parses_csv_and_ignores_blanks() {
        let (_cluster, kafka) = common_kafka::test::mock_cluster();
        let mut config = LoopConfig {
            kafka,
            kafka_topic: "t".into(),
            kafka_group_id: "g".into(),
            poll_timeout_ms: 250,
            commit_interval_ms: 5000,
            commit_retry_interval_ms: 500,
            max_commit_attempts: 5,
            max_deferred_commits: 0,
            max_delay_rebalance_ms: 5000,
            commit_interval_during_delay_ms: 100,
            close_timeout_ms: 10000,
            ack_mode: AckMode::AutoAck,
            bind_host: "::".into(),
            bind_port: 3310,
            emit_endpoint: "http://localhost:8000/ingest".into(),
            emit_timeout_ms: 5000,
            assign_partitions: String::new(),
        };
        assert!(config.manual_partitions().is_empty());

        config.assign_partitions = " 0, 1,2 ,".into();
        assert_eq!(config.manual_partitions(), vec![0, 1, 2]);
    }
}
