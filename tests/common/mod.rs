//! Shared test utilities for receiver integration tests.

use async_trait::async_trait;
use lambda_telemetry_receiver::{ConsumerError, LogsConsumer, MetricsConsumer, TracesConsumer};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Polls the intake endpoint until the listener answers anything at all.
///
/// The intake has no health route; any response, including a 400 for the
/// empty body, proves the listener is up.
pub async fn wait_for_ready(port: u16, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    let url = format!("http://127.0.0.1:{port}/");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .map_err(|e| format!("failed to create HTTP client: {e}"))?;

    while Instant::now() < deadline {
        if client.get(&url).send().await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Err(format!(
        "intake listener did not come up within {timeout:?} on port {port}"
    ))
}

/// Traces consumer that records every batch it is handed.
#[derive(Default)]
pub struct CaptureTraces(pub Mutex<Vec<ExportTraceServiceRequest>>);

#[async_trait]
impl TracesConsumer for CaptureTraces {
    async fn consume(&self, batch: ExportTraceServiceRequest) -> Result<(), ConsumerError> {
        self.0.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Logs consumer that records every batch it is handed.
#[derive(Default)]
pub struct CaptureLogs(pub Mutex<Vec<ExportLogsServiceRequest>>);

#[async_trait]
impl LogsConsumer for CaptureLogs {
    async fn consume(&self, batch: ExportLogsServiceRequest) -> Result<(), ConsumerError> {
        self.0.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Metrics consumer that records every batch it is handed.
#[derive(Default)]
pub struct CaptureMetrics(pub Mutex<Vec<ExportMetricsServiceRequest>>);

#[async_trait]
impl MetricsConsumer for CaptureMetrics {
    async fn consume(&self, batch: ExportMetricsServiceRequest) -> Result<(), ConsumerError> {
        self.0.lock().unwrap().push(batch);
        Ok(())
    }
}
