//! Telemetry receiver: HTTP intake, event routing, and lifecycle.
//!
//! One receiver owns a loopback HTTP listener that the host Telemetry API
//! pushes JSON event batches to. Each batch is decoded, routed per event
//! class to the signal translators, and the results are handed to whichever
//! consumer slots the embedding pipelines have wired. Signals produced by
//! one batch are emitted together, one request per signal kind.

use crate::attr::scope;
use crate::config::Config;
use crate::consumer::{ConsumerError, LogsConsumer, MetricsConsumer, TracesConsumer};
use crate::error::ReceiverError;
use crate::event::Event;
use crate::resource::detect_resource;
use crate::subscription::{SubscriptionRequest, TelemetryApiClient};
use crate::traces::TraceAssembler;
use crate::{logs, metrics};
use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::{Metric, ResourceMetrics, ScopeMetrics};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use std::collections::HashSet;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PLATFORM_INIT_START: &str = "platform.initStart";
const PLATFORM_INIT_RUNTIME_DONE: &str = "platform.initRuntimeDone";
const PLATFORM_START: &str = "platform.start";
const PLATFORM_RUNTIME_DONE: &str = "platform.runtimeDone";
const PLATFORM_REPORT: &str = "platform.report";
const PLATFORM_PREFIX: &str = "platform.";
const FUNCTION: &str = "function";
const EXTENSION: &str = "extension";

const AWS_SAM_LOCAL_ENV: &str = "AWS_SAM_LOCAL";

/// Upper bound on remembered malformed timestamps, so the once-per-pattern
/// warning cannot grow without bound.
const WARNED_TIMES_CAP: usize = 128;

/// Receiver-lifetime counters for dropped and irregular events.
#[derive(Debug, Default)]
pub struct Counters {
    unknown_event_type: AtomicU64,
    orphan_start: AtomicU64,
    duplicate_start: AtomicU64,
    orphan_end: AtomicU64,
    stale_start: AtomicU64,
}

impl Counters {
    /// Events whose class tag is outside the recognized set.
    pub fn unknown_event_type(&self) -> u64 {
        self.unknown_event_type.load(Ordering::Relaxed)
    }

    /// Start events dropped because they carried no `requestId`.
    pub fn orphan_start(&self) -> u64 {
        self.orphan_start.load(Ordering::Relaxed)
    }

    /// Start events that overwrote an already-pending start.
    pub fn duplicate_start(&self) -> u64 {
        self.duplicate_start.load(Ordering::Relaxed)
    }

    /// End events that arrived without a matching start.
    pub fn orphan_end(&self) -> u64 {
        self.orphan_end.load(Ordering::Relaxed)
    }

    /// Pending starts dropped by the expiry sweep.
    pub fn stale_start(&self) -> u64 {
        self.stale_start.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_unknown_event_type(&self) {
        self.unknown_event_type.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_orphan_start(&self) {
        self.orphan_start.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_duplicate_start(&self) {
        self.duplicate_start.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_orphan_end(&self) {
        self.orphan_end.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stale_start(&self, count: u64) {
        self.stale_start.fetch_add(count, Ordering::Relaxed);
    }
}

struct ServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RunState {
    pipelines: usize,
    server: Option<ServerHandle>,
}

/// Receiver for the host Telemetry API event stream.
///
/// Constructed through [`crate::factory::acquire`]; pipelines sharing a
/// configuration fingerprint share one instance. The intake handler serves
/// concurrent connections; the trace assembler is the only mutable state
/// and serializes its own updates.
pub struct TelemetryReceiver {
    config: Config,
    resource: Resource,
    client: TelemetryApiClient,
    assembler: TraceAssembler,
    counters: Arc<Counters>,
    traces: OnceLock<Arc<dyn TracesConsumer>>,
    logs: OnceLock<Arc<dyn LogsConsumer>>,
    metrics: OnceLock<Arc<dyn MetricsConsumer>>,
    state: tokio::sync::Mutex<RunState>,
    warned_times: std::sync::Mutex<HashSet<String>>,
}

impl TelemetryReceiver {
    /// Creates a receiver, freezing the resource descriptor and the host
    /// API coordinates from the current process environment.
    pub(crate) fn new(config: Config) -> Self {
        let counters = Arc::new(Counters::default());
        Self {
            config,
            resource: detect_resource(),
            client: TelemetryApiClient::from_env(),
            assembler: TraceAssembler::new(counters.clone()),
            counters,
            traces: OnceLock::new(),
            logs: OnceLock::new(),
            metrics: OnceLock::new(),
            state: tokio::sync::Mutex::new(RunState::default()),
            warned_times: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Returns the receiver configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the receiver's counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Wires the traces consumer slot; the first registration wins.
    pub fn register_traces_consumer(&self, consumer: Arc<dyn TracesConsumer>) {
        if self.traces.set(consumer).is_err() {
            tracing::warn!("traces consumer already registered, keeping the first");
        }
    }

    /// Wires the logs consumer slot; the first registration wins.
    pub fn register_logs_consumer(&self, consumer: Arc<dyn LogsConsumer>) {
        if self.logs.set(consumer).is_err() {
            tracing::warn!("logs consumer already registered, keeping the first");
        }
    }

    /// Wires the metrics consumer slot; the first registration wins.
    pub fn register_metrics_consumer(&self, consumer: Arc<dyn MetricsConsumer>) {
        if self.metrics.set(consumer).is_err() {
            tracing::warn!("metrics consumer already registered, keeping the first");
        }
    }

    /// Starts the receiver for one signal pipeline.
    ///
    /// The first pipeline binds the intake listener and performs the
    /// Telemetry API handshake; later pipelines only take a reference.
    ///
    /// # Errors
    ///
    /// Bind and subscription failures are fatal and leave the receiver
    /// stopped.
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), ReceiverError> {
        let mut state = self.state.lock().await;
        if state.pipelines > 0 {
            state.pipelines += 1;
            return Ok(());
        }

        let addr = listen_address(self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ReceiverError::Listener {
                addr: addr.clone(),
                source,
            })?;
        tracing::info!(addr = %addr, "telemetry listener started");

        let cancel = CancellationToken::new();
        let app = Router::new()
            .fallback(handle_batch)
            .with_state(Arc::clone(&self));
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(error) = axum::serve(listener, app)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await
                {
                    tracing::error!(error = %error, "telemetry listener terminated");
                }
            }
        });

        let request =
            SubscriptionRequest::from_config(&self.config, destination_uri(self.config.port));
        if let Err(error) = self.client.subscribe(&request).await {
            cancel.cancel();
            let _ = task.await;
            return Err(ReceiverError::Subscription(error));
        }

        state.pipelines = 1;
        state.server = Some(ServerHandle { cancel, task });
        Ok(())
    }

    /// Stops the receiver for one signal pipeline.
    ///
    /// The last pipeline withdraws the subscription (best effort), shuts
    /// the listener down within `timeout` letting in-flight handlers
    /// finish, and discards unmatched trace state. Returns `true` when
    /// this call fully shut the receiver down.
    pub(crate) async fn stop(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock().await;
        match state.pipelines {
            0 => return false,
            1 => state.pipelines = 0,
            _ => {
                state.pipelines -= 1;
                return false;
            }
        }

        if let Some(server) = state.server.take() {
            let request =
                SubscriptionRequest::from_config(&self.config, destination_uri(self.config.port));
            self.client.unsubscribe(&request).await;

            server.cancel.cancel();
            if tokio::time::timeout(timeout, server.task).await.is_err() {
                tracing::warn!("telemetry listener did not drain before the stop deadline");
            }
        }

        self.assembler.clear();
        true
    }

    /// Routes every event of one batch and emits the collected signals.
    pub(crate) async fn process_batch(&self, events: Vec<Event>) {
        let traces_on = self.traces.get().is_some();
        let logs_on = self.logs.get().is_some();
        let metrics_on = self.metrics.get().is_some();

        let mut spans: Vec<Span> = Vec::new();
        let mut log_records: Vec<LogRecord> = Vec::new();
        let mut gauges: Vec<Metric> = Vec::new();

        for event in &events {
            let time = self.event_time(event);
            match event.event_type.as_str() {
                PLATFORM_INIT_START => {
                    if traces_on {
                        self.assembler.start_init(&event.record, time);
                    }
                }
                PLATFORM_START => {
                    if traces_on {
                        self.assembler.start_invocation(&event.record, time);
                    }
                }
                PLATFORM_INIT_RUNTIME_DONE => {
                    if traces_on {
                        spans.push(self.assembler.finish_init(&event.record, time));
                    }
                }
                PLATFORM_RUNTIME_DONE => {
                    if traces_on {
                        spans.push(self.assembler.finish_invocation(&event.record, time));
                    }
                }
                PLATFORM_REPORT => {
                    if metrics_on {
                        gauges.extend(metrics::translate_report(&event.record, time));
                    }
                    if logs_on {
                        log_records.push(logs::translate(event, time));
                    }
                }
                FUNCTION | EXTENSION => {
                    if logs_on {
                        log_records.push(logs::translate(event, time));
                    }
                }
                other if other.starts_with(PLATFORM_PREFIX) => {
                    if logs_on {
                        log_records.push(logs::translate(event, time));
                    }
                }
                other => {
                    self.counters.inc_unknown_event_type();
                    tracing::debug!(event_type = %other, "dropping unknown event type");
                }
            }
        }

        if !spans.is_empty()
            && let Some(consumer) = self.traces.get()
        {
            log_consumer_result(consumer.consume(self.wrap_spans(spans)).await, "traces");
        }
        if !log_records.is_empty()
            && let Some(consumer) = self.logs.get()
        {
            log_consumer_result(consumer.consume(self.wrap_logs(log_records)).await, "logs");
        }
        if !gauges.is_empty()
            && let Some(consumer) = self.metrics.get()
        {
            log_consumer_result(consumer.consume(self.wrap_metrics(gauges)).await, "metrics");
        }
    }

    /// Parses the event timestamp, substituting the wall clock on failure.
    ///
    /// Each distinct malformed timestamp is warned about once per receiver
    /// lifetime; the event stays useful even with an inexact timestamp.
    fn event_time(&self, event: &Event) -> DateTime<Utc> {
        match event.timestamp() {
            Ok(time) => time,
            Err(error) => {
                let mut warned = self
                    .warned_times
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if warned.len() < WARNED_TIMES_CAP && warned.insert(event.time.clone()) {
                    tracing::warn!(
                        time = %event.time,
                        error = %error,
                        "unparseable event timestamp, substituting wall clock"
                    );
                }
                Utc::now()
            }
        }
    }

    fn wrap_spans(&self, spans: Vec<Span>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(self.resource.clone()),
                scope_spans: vec![ScopeSpans {
                    scope: Some(scope()),
                    spans,
                    schema_url: SCHEMA_URL.to_string(),
                }],
                schema_url: SCHEMA_URL.to_string(),
            }],
        }
    }

    fn wrap_logs(&self, log_records: Vec<LogRecord>) -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: Some(self.resource.clone()),
                scope_logs: vec![ScopeLogs {
                    scope: Some(scope()),
                    log_records,
                    schema_url: SCHEMA_URL.to_string(),
                }],
                schema_url: SCHEMA_URL.to_string(),
            }],
        }
    }

    fn wrap_metrics(&self, metrics: Vec<Metric>) -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(self.resource.clone()),
                scope_metrics: vec![ScopeMetrics {
                    scope: Some(scope()),
                    metrics,
                    schema_url: SCHEMA_URL.to_string(),
                }],
                schema_url: SCHEMA_URL.to_string(),
            }],
        }
    }
}

/// Selects the intake bind address.
///
/// Inside the platform sandbox the reserved loopback name
/// `sandbox.localdomain` is used; under SAM local emulation
/// (`AWS_SAM_LOCAL=true`) plain `127.0.0.1` is routable instead.
fn listen_address(port: u16) -> String {
    if env::var(AWS_SAM_LOCAL_ENV).as_deref() == Ok("true") {
        format!("127.0.0.1:{port}")
    } else {
        format!("sandbox.localdomain:{port}")
    }
}

fn destination_uri(port: u16) -> String {
    format!("http://sandbox.localdomain:{port}/")
}

fn log_consumer_result(result: Result<(), ConsumerError>, signal: &str) {
    match result {
        Ok(()) => {}
        Err(error @ ConsumerError::Transient(_)) => {
            tracing::warn!(signal, error = %error, "consumer rejected batch");
        }
        Err(error @ ConsumerError::Permanent(_)) => {
            tracing::error!(signal, error = %error, "consumer rejected batch");
        }
    }
}

/// Single intake handler: every method on every path lands here.
async fn handle_batch(
    State(receiver): State<Arc<TelemetryReceiver>>,
    request: Request,
) -> StatusCode {
    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(error = %error, "failed to read event batch body");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let events: Vec<Event> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(error) => {
            tracing::warn!(error = %error, "failed to decode event batch");
            return StatusCode::BAD_REQUEST;
        }
    };

    tracing::debug!(count = events.len(), "received event batch");
    receiver.process_batch(events).await;
    StatusCode::OK
}
