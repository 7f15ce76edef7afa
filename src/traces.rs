//! Trace assembly from platform lifecycle events.
//!
//! Pairs point-in-time start/end lifecycle events into spans. Invocation
//! pairs are keyed by `requestId`; the init phase has a single pending
//! slot. Events may arrive out of order, duplicated, or never complete:
//! unmatched ends are preserved as zero-duration spans and unmatched
//! starts age out after [`PENDING_TTL`].

use crate::attr::{any_value, kv_any, kv_string, unix_nanos};
use crate::receiver::Counters;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::trace::v1::{Span, Status, span::SpanKind, status};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long an unmatched start half may wait for its end half.
const PENDING_TTL: Duration = Duration::from_secs(15 * 60);

/// Span name for the invocation phase.
const INVOKE_SPAN_NAME: &str = "lambda.invoke";
/// Span name for the cold-start init phase.
const INIT_SPAN_NAME: &str = "lambda.init";

/// Span attribute carrying the platform-reported completion status.
const STATUS_ATTR: &str = "status";
/// Completion status assumed when the end record carries none.
const UNKNOWN_STATUS: &str = "unknown";
/// Status value that maps to an unset span status code.
const SUCCESS_STATUS: &str = "success";

struct PendingStart {
    time: DateTime<Utc>,
    record: Map<String, Value>,
    created_at: Instant,
}

impl PendingStart {
    fn new(record: &Value, time: DateTime<Utc>) -> Self {
        Self {
            time,
            record: record.as_object().cloned().unwrap_or_default(),
            created_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct State {
    starts: HashMap<String, PendingStart>,
    init: Option<PendingStart>,
}

/// Stateful correlator pairing start/end lifecycle events into spans.
///
/// All updates go through one mutex; synthesized spans are returned to the
/// caller so consumer emission happens outside the lock.
pub(crate) struct TraceAssembler {
    state: Mutex<State>,
    ttl: Duration,
    counters: Arc<Counters>,
}

impl TraceAssembler {
    pub(crate) fn new(counters: Arc<Counters>) -> Self {
        Self::with_ttl(counters, PENDING_TTL)
    }

    fn with_ttl(counters: Arc<Counters>, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ttl,
            counters,
        }
    }

    /// Records a `platform.start` half.
    ///
    /// A start without a `requestId` cannot ever be matched and is dropped.
    /// A start for an already-pending request overwrites the previous one,
    /// which models cold-start retries where the host re-emits.
    pub(crate) fn start_invocation(&self, record: &Value, time: DateTime<Utc>) {
        let Some(request_id) = request_id(record) else {
            self.counters.inc_orphan_start();
            tracing::debug!("platform.start without requestId dropped");
            return;
        };

        let mut state = self.lock();
        self.sweep(&mut state);
        if state
            .starts
            .insert(request_id.clone(), PendingStart::new(record, time))
            .is_some()
        {
            self.counters.inc_duplicate_start();
            tracing::debug!(request_id = %request_id, "duplicate platform.start replaced pending entry");
        }
    }

    /// Records a `platform.initStart` half.
    pub(crate) fn start_init(&self, record: &Value, time: DateTime<Utc>) {
        let mut state = self.lock();
        self.sweep(&mut state);
        if state.init.replace(PendingStart::new(record, time)).is_some() {
            self.counters.inc_duplicate_start();
            tracing::debug!("duplicate platform.initStart replaced pending entry");
        }
    }

    /// Completes an invocation pair and returns the synthesized span.
    ///
    /// An end with no matching start still produces a zero-duration span so
    /// the fact that the invocation ended is preserved.
    pub(crate) fn finish_invocation(&self, record: &Value, time: DateTime<Utc>) -> Span {
        let matched = match request_id(record) {
            Some(request_id) => self.lock().starts.remove(&request_id),
            None => None,
        };
        self.finish(INVOKE_SPAN_NAME, SpanKind::Server, matched, record, time)
    }

    /// Completes the init pair and returns the synthesized span.
    pub(crate) fn finish_init(&self, record: &Value, time: DateTime<Utc>) -> Span {
        let matched = self.lock().init.take();
        self.finish(INIT_SPAN_NAME, SpanKind::Internal, matched, record, time)
    }

    /// Discards all pending halves.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.starts.clear();
        state.init = None;
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        let state = self.lock();
        state.starts.len() + usize::from(state.init.is_some())
    }

    fn finish(
        &self,
        name: &str,
        kind: SpanKind,
        matched: Option<PendingStart>,
        end_record: &Value,
        end_time: DateTime<Utc>,
    ) -> Span {
        match matched {
            Some(start) => build_span(name, kind, start.time, end_time, Some(&start.record), end_record),
            None => {
                self.counters.inc_orphan_end();
                tracing::debug!(span = name, "end event without matching start");
                build_span(name, kind, end_time, end_time, None, end_record)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self, state: &mut State) {
        let now = Instant::now();
        let ttl = self.ttl;

        let before = state.starts.len();
        state
            .starts
            .retain(|_, pending| now.duration_since(pending.created_at) <= ttl);
        let mut stale = (before - state.starts.len()) as u64;

        if state
            .init
            .as_ref()
            .is_some_and(|pending| now.duration_since(pending.created_at) > ttl)
        {
            state.init = None;
            stale += 1;
        }

        if stale > 0 {
            self.counters.add_stale_start(stale);
            tracing::debug!(count = stale, "dropped stale pending starts");
        }
    }
}

fn request_id(record: &Value) -> Option<String> {
    record
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn build_span(
    name: &str,
    kind: SpanKind,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    start_record: Option<&Map<String, Value>>,
    end_record: &Value,
) -> Span {
    let status_text = end_record
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_STATUS);

    let mut attributes = merge_attributes(start_record, end_record);
    if !attributes.iter().any(|kv| kv.key == STATUS_ATTR) {
        attributes.push(kv_string(STATUS_ATTR, status_text));
    }

    Span {
        trace_id: rand::random::<[u8; 16]>().to_vec(),
        span_id: rand::random::<[u8; 8]>().to_vec(),
        name: name.to_string(),
        kind: kind as i32,
        start_time_unix_nano: unix_nanos(start),
        end_time_unix_nano: unix_nanos(end),
        attributes,
        status: Some(span_status(status_text)),
        ..Default::default()
    }
}

/// Merges the attribute maps of both halves; the end record wins on key
/// collisions.
fn merge_attributes(
    start: Option<&Map<String, Value>>,
    end: &Value,
) -> Vec<opentelemetry_proto::tonic::common::v1::KeyValue> {
    let mut merged = start.cloned().unwrap_or_default();
    if let Some(fields) = end.as_object() {
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
        .iter()
        .map(|(key, value)| kv_any(key, any_value(value)))
        .collect()
}

fn span_status(status_text: &str) -> Status {
    if status_text == SUCCESS_STATUS {
        Status {
            message: String::new(),
            code: status::StatusCode::Unset as i32,
        }
    } else {
        Status {
            message: format!("platform reported status {status_text}"),
            code: status::StatusCode::Error as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::any_value;
    use serde_json::json;

    fn at(time: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(time)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn assembler() -> (TraceAssembler, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (TraceAssembler::new(counters.clone()), counters)
    }

    fn attribute<'a>(span: &'a Span, key: &str) -> Option<&'a str> {
        span.attributes
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| match &v.value {
                Some(any_value::Value::StringValue(s)) => Some(s.as_str()),
                _ => None,
            })
    }

    #[test]
    fn pairs_init_start_and_runtime_done() {
        let (assembler, counters) = assembler();

        assembler.start_init(&json!({}), at("2006-01-02T15:04:04Z"));
        let span = assembler.finish_init(&json!({"status": "success"}), at("2006-01-02T15:04:05Z"));

        assert_eq!(span.name, "lambda.init");
        assert_eq!(
            span.end_time_unix_nano - span.start_time_unix_nano,
            1_000_000_000
        );
        assert_eq!(attribute(&span, "status"), Some("success"));
        assert_eq!(
            span.status.unwrap().code,
            status::StatusCode::Unset as i32
        );
        assert_eq!(counters.orphan_end(), 0);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn pairs_invocation_across_batches() {
        let (assembler, _counters) = assembler();

        assembler.start_invocation(
            &json!({"requestId": "req-1", "version": "$LATEST"}),
            at("2023-10-12T12:35:00.000Z"),
        );
        let span = assembler.finish_invocation(
            &json!({"requestId": "req-1", "status": "success"}),
            at("2023-10-12T12:35:00.456Z"),
        );

        assert_eq!(span.name, "lambda.invoke");
        assert_eq!(span.kind, SpanKind::Server as i32);
        assert_eq!(
            span.end_time_unix_nano - span.start_time_unix_nano,
            456_000_000
        );
        // Attributes merge both halves.
        assert_eq!(attribute(&span, "version"), Some("$LATEST"));
        assert_eq!(attribute(&span, "requestId"), Some("req-1"));
        assert_eq!(span.trace_id.len(), 16);
        assert_eq!(span.span_id.len(), 8);
    }

    #[test]
    fn orphan_end_becomes_zero_duration_span() {
        let (assembler, counters) = assembler();

        let span = assembler.finish_invocation(
            &json!({"requestId": "r1", "status": "success"}),
            at("2023-10-12T12:35:00.456Z"),
        );

        assert_eq!(span.start_time_unix_nano, span.end_time_unix_nano);
        assert_eq!(attribute(&span, "requestId"), Some("r1"));
        assert_eq!(counters.orphan_end(), 1);
    }

    #[test]
    fn duplicate_start_keeps_the_latest_half() {
        let (assembler, counters) = assembler();

        assembler.start_invocation(&json!({"requestId": "req-1"}), at("2023-10-12T12:00:00Z"));
        assembler.start_invocation(&json!({"requestId": "req-1"}), at("2023-10-12T12:00:10Z"));
        let span = assembler.finish_invocation(
            &json!({"requestId": "req-1", "status": "success"}),
            at("2023-10-12T12:00:20Z"),
        );

        assert_eq!(counters.duplicate_start(), 1);
        assert_eq!(
            span.end_time_unix_nano - span.start_time_unix_nano,
            10_000_000_000
        );
    }

    #[test]
    fn start_without_request_id_is_dropped() {
        let (assembler, counters) = assembler();

        assembler.start_invocation(&json!({"version": "$LATEST"}), at("2023-10-12T12:00:00Z"));

        assert_eq!(counters.orphan_start(), 1);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn failure_status_marks_the_span() {
        let (assembler, _counters) = assembler();

        let span = assembler.finish_invocation(
            &json!({"requestId": "r1", "status": "timeout"}),
            at("2023-10-12T12:00:00Z"),
        );

        let status = span.status.unwrap();
        assert_eq!(status.code, status::StatusCode::Error as i32);
        assert!(status.message.contains("timeout"));
    }

    #[test]
    fn end_without_status_defaults_to_unknown() {
        let (assembler, _counters) = assembler();

        let span = assembler.finish_invocation(&json!({"requestId": "r1"}), at("2023-10-12T12:00:00Z"));

        assert_eq!(attribute(&span, "status"), Some("unknown"));
        assert_eq!(
            span.status.unwrap().code,
            status::StatusCode::Error as i32
        );
    }

    #[test]
    fn stale_starts_age_out_on_the_next_insert() {
        let counters = Arc::new(Counters::default());
        let assembler = TraceAssembler::with_ttl(counters.clone(), Duration::ZERO);

        assembler.start_invocation(&json!({"requestId": "old"}), at("2023-10-12T12:00:00Z"));
        assert_eq!(assembler.pending_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        assembler.start_invocation(&json!({"requestId": "new"}), at("2023-10-12T12:15:00Z"));

        assert_eq!(counters.stale_start(), 1);
        assert_eq!(assembler.pending_count(), 1);
    }

    #[test]
    fn clear_discards_pending_state() {
        let (assembler, _counters) = assembler();

        assembler.start_init(&json!({}), at("2023-10-12T12:00:00Z"));
        assembler.start_invocation(&json!({"requestId": "r1"}), at("2023-10-12T12:00:00Z"));
        assert_eq!(assembler.pending_count(), 2);

        assembler.clear();
        assert_eq!(assembler.pending_count(), 0);
    }
}
