//! OTLP attribute and timestamp helpers shared by the signal translators.

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue, any_value};

/// Instrumentation scope name attached to every emitted signal.
pub(crate) const SCOPE_NAME: &str = "lambda-telemetry-receiver";
/// Instrumentation scope version attached to every emitted signal.
pub(crate) const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the receiver's instrumentation scope.
pub(crate) fn scope() -> InstrumentationScope {
    InstrumentationScope {
        name: SCOPE_NAME.to_string(),
        version: SCOPE_VERSION.to_string(),
        ..Default::default()
    }
}

/// Creates a string key-value pair.
pub(crate) fn kv_string(key: &str, value: &str) -> KeyValue {
    kv_any(key, string_value(value))
}

/// Creates a key-value pair from a prepared value.
pub(crate) fn kv_any(key: &str, value: AnyValue) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(value),
    }
}

/// Wraps a string in an OTLP value.
pub(crate) fn string_value(value: &str) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(value.to_string())),
    }
}

/// Maps a JSON value to the closest OTLP value.
///
/// Arrays, objects and null keep their JSON encoding as a string.
pub(crate) fn any_value(value: &serde_json::Value) -> AnyValue {
    let value = match value {
        serde_json::Value::String(s) => any_value::Value::StringValue(s.clone()),
        serde_json::Value::Bool(b) => any_value::Value::BoolValue(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => any_value::Value::IntValue(i),
            None => any_value::Value::DoubleValue(n.as_f64().unwrap_or(0.0)),
        },
        other => any_value::Value::StringValue(other.to_string()),
    };
    AnyValue { value: Some(value) }
}

/// Converts a timestamp to nanoseconds since the Unix epoch.
///
/// Times outside the representable range clamp to zero.
pub(crate) fn unix_nanos(time: DateTime<Utc>) -> u64 {
    time.timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or(0)
}
