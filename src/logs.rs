//! Log signal translation.
//!
//! Produces structured log records from `function` and `extension` lines
//! and from platform lifecycle events outside trace assembly. Structured
//! records keep their full payload in the body; well-known fields are
//! additionally lifted into the record's typed slots.

use crate::attr::{any_value, kv_string, string_value, unix_nanos};
use crate::event::Event;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, SeverityNumber};
use opentelemetry_semantic_conventions::attribute::FAAS_INVOCATION_ID;
use serde_json::{Map, Value};

/// Attribute carrying the envelope event class on every log record.
const EVENT_TYPE_ATTR: &str = "event.type";
/// W3C trace id length in hex characters.
const TRACE_ID_HEX_LEN: usize = 32;
/// W3C span id length in hex characters.
const SPAN_ID_HEX_LEN: usize = 16;

/// Translates one event into a log record.
pub(crate) fn translate(event: &Event, time: DateTime<Utc>) -> LogRecord {
    let nanos = unix_nanos(time);
    let mut record = LogRecord {
        time_unix_nano: nanos,
        observed_time_unix_nano: nanos,
        attributes: vec![kv_string(EVENT_TYPE_ATTR, &event.event_type)],
        ..Default::default()
    };

    match &event.record {
        Value::Object(fields) => translate_object(&mut record, fields),
        Value::String(line) => {
            record.body = Some(string_value(line));
            if let Some((number, text)) = infer_severity(line) {
                record.severity_number = number as i32;
                record.severity_text = text.to_string();
            }
        }
        other => record.body = Some(any_value(other)),
    }

    record
}

fn translate_object(record: &mut LogRecord, fields: &Map<String, Value>) {
    record.body = Some(string_value(&Value::Object(fields.clone()).to_string()));

    if let Some(timestamp) = fields.get("timestamp").and_then(Value::as_str)
        && let Ok(time) = DateTime::parse_from_rfc3339(timestamp)
    {
        record.time_unix_nano = unix_nanos(time.with_timezone(&Utc));
    }

    if let Some(level) = fields.get("level").and_then(Value::as_str)
        && let Some((number, text)) = severity_from_level(level)
    {
        record.severity_number = number as i32;
        record.severity_text = text.to_string();
    }

    if let Some(request_id) = fields.get("requestId").and_then(Value::as_str) {
        record
            .attributes
            .push(kv_string(FAAS_INVOCATION_ID, request_id));
    }

    if let Some(message) = fields.get("message").and_then(Value::as_str) {
        record.attributes.push(kv_string("message", message));
    }

    match (
        hex_field(fields, "trace_id", TRACE_ID_HEX_LEN),
        hex_field(fields, "span_id", SPAN_ID_HEX_LEN),
    ) {
        (Some(trace_id), Some(span_id)) => {
            record.trace_id = trace_id;
            record.span_id = span_id;
        }
        _ => {
            for key in ["trace_id", "span_id"] {
                if let Some(value) = fields.get(key).and_then(Value::as_str) {
                    record.attributes.push(kv_string(key, value));
                }
            }
        }
    }
}

/// Decodes a field as fixed-length hex, or `None` when it does not qualify.
fn hex_field(fields: &Map<String, Value>, key: &str, hex_len: usize) -> Option<Vec<u8>> {
    let value = fields.get(key)?.as_str()?;
    if value.len() != hex_len {
        return None;
    }
    hex::decode(value).ok()
}

/// Infers severity from the leading token of a plain log line.
fn infer_severity(line: &str) -> Option<(SeverityNumber, &'static str)> {
    let token = line.split_whitespace().next()?;
    severity_from_level(token.trim_matches(|c| matches!(c, '[' | ']' | ':')))
}

fn severity_from_level(level: &str) -> Option<(SeverityNumber, &'static str)> {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => Some((SeverityNumber::Trace, "TRACE")),
        "DEBUG" => Some((SeverityNumber::Debug, "DEBUG")),
        "INFO" => Some((SeverityNumber::Info, "INFO")),
        "WARN" => Some((SeverityNumber::Warn, "WARN")),
        "ERROR" => Some((SeverityNumber::Error, "ERROR")),
        _ => None,
    }
}
