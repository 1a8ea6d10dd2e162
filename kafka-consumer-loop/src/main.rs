use std::sync::Arc;

use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use health::HealthRegistry;
use kafka_consumer_loop::sink_http::HttpJsonSink;
use kafka_consumer_loop::{ConsumerLoop, LoopConfig, RebalanceListener};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

common_alloc::used!();

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "kafka consumer loop"
}

struct NoopRebalanceListener;

impl RebalanceListener for NoopRebalanceListener {}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting kafka consumer loop...");

    let config = Arc::new(LoopConfig::init_from_env()?);

    info!(
        topic = config.kafka_topic,
        group_id = config.kafka_group_id,
        ack_mode = ?config.ack_mode,
        "Configuration loaded"
    );

    let health_registry = HealthRegistry::new("liveness");
    let health_handle = health_registry
        .register("kafka-consumer-loop".to_string(), config.poll_timeout() * 10)
        .await;

    let bind = format!("{}:{}", config.bind_host, config.bind_port);
    let health_router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get({
                let registry = health_registry.clone();
                move || {
                    let registry = registry.clone();
                    async move { registry.get_status() }
                }
            }),
        )
        .route(
            "/_liveness",
            get({
                let registry = health_registry.clone();
                move || {
                    let registry = registry.clone();
                    async move { registry.get_status() }
                }
            }),
        );
    let health_router = setup_metrics_routes(health_router);

    tokio::task::spawn(async move {
        serve(health_router, &bind)
            .await
            .expect("failed to start health server");
    });

    let mut client_config = rdkafka::ClientConfig::new();
    client_config
        .set("group.id", &config.kafka_group_id)
        .set("bootstrap.servers", &config.kafka.kafka_hosts)
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest");
    if config.kafka.kafka_tls {
        client_config.set("security.protocol", "ssl");
    }

    let sink = Arc::new(HttpJsonSink::new(
        config.emit_endpoint.clone(),
        config.emit_timeout(),
    ));
    let listener = Arc::new(NoopRebalanceListener);

    let mut consumer_loop = ConsumerLoop::new(
        config.clone(),
        client_config,
        sink,
        listener,
        Some(Arc::new(health_handle)),
    )
    .await?;

    consumer_loop.request(i64::MAX);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    consumer_loop.stop().await;

    info!("Kafka consumer loop shut down");
    Ok(())
}
