//! Telemetry event envelope decoding.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One event from the host Telemetry API stream.
///
/// `record` is schema-on-read: its shape depends on `type` and is never
/// assumed to conform to a fixed schema. A missing `record` decodes to
/// JSON null.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    /// Raw event timestamp as delivered by the host.
    pub time: String,
    /// Event class tag, e.g. `platform.start` or `function`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload; any JSON value.
    #[serde(default)]
    pub record: serde_json::Value,
}

impl Event {
    /// Parses the envelope timestamp as RFC 3339.
    ///
    /// The receiver substitutes the wall clock on failure; see
    /// `TelemetryReceiver::event_time`.
    pub fn timestamp(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(&self.time).map(|time| time.with_timezone(&Utc))
    }
}
