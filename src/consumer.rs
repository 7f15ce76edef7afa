//! Downstream consumer capabilities for the three signal pipelines.
//!
//! Each signal kind gets its own capability handle rather than one
//! polymorphic observer, so a pipeline wired for a single signal never pays
//! for translation work it did not ask for. Slots may be left unset, in
//! which case the receiver is a no-op for that signal.

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use thiserror::Error;

/// Failure reported by a downstream consumer.
///
/// The receiver retries neither variant: transient failures are logged at
/// warn level, permanent failures at error level, and the batch is dropped.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The consumer could not accept the batch right now.
    #[error("transient consumer failure")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The consumer will never accept this batch.
    #[error("permanent consumer failure")]
    Permanent(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Consumes trace batches produced by the receiver.
#[async_trait]
pub trait TracesConsumer: Send + Sync {
    /// Delivers one batch of spans.
    async fn consume(&self, batch: ExportTraceServiceRequest) -> Result<(), ConsumerError>;
}

/// Consumes log batches produced by the receiver.
#[async_trait]
pub trait LogsConsumer: Send + Sync {
    /// Delivers one batch of log records.
    async fn consume(&self, batch: ExportLogsServiceRequest) -> Result<(), ConsumerError>;
}

/// Consumes metric batches produced by the receiver.
#[async_trait]
pub trait MetricsConsumer: Send + Sync {
    /// Delivers one batch of metric data points.
    async fn consume(&self, batch: ExportMetricsServiceRequest) -> Result<(), ConsumerError>;
}
