//! A concrete `RecordSink` for the binary entry point: forwards each record batch as JSON to a
//! configured HTTP endpoint. The transport itself is out of scope for the core loop (§6.2) — this
//! is one reasonable downstream, not the only one a caller of this crate has to use.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::records::RecordBatch;
use crate::sink::{EmitError, EmitOutcome, RecordSink};

#[derive(Serialize)]
struct WireRecord<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    timestamp_millis: Option<i64>,
    key: Option<&'a [u8]>,
    payload: Option<&'a [u8]>,
}

pub struct HttpJsonSink {
    client: Client,
    endpoint: String,
}

impl HttpJsonSink {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { client, endpoint }
    }
}

#[async_trait]
impl RecordSink for HttpJsonSink {
    async fn emit_next(&self, batch: RecordBatch) -> EmitOutcome {
        let wire: Vec<WireRecord<'_>> = batch
            .records
            .iter()
            .map(|r| WireRecord {
                topic: &r.partition.topic,
                partition: r.partition.partition,
                offset: r.offset,
                timestamp_millis: r.timestamp_millis,
                key: r.key.as_deref(),
                payload: r.payload.as_deref(),
            })
            .collect();

        let response = self.client.post(&self.endpoint).json(&wire).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => EmitOutcome::Accepted,
            Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error() => {
                EmitOutcome::Retry(batch, EmitError::Busy)
            }
            Ok(resp) => EmitOutcome::Failed(EmitError::Other(format!(
                "downstream returned {}",
                resp.status()
            ))),
            Err(err) if err.is_timeout() || err.is_connect() => EmitOutcome::Retry(batch, EmitError::Busy),
            Err(err) => EmitOutcome::Failed(EmitError::Other(err.to_string())),
        }
    }

    async fn emit_error(&self, err: &dyn std::error::Error) {
        tracing::error!(%err, "consumer loop reported a terminal error");
    }
}
