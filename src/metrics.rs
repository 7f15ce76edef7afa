//! Metric signal translation for `platform.report` events.

use crate::attr::{kv_string, unix_nanos};
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::metrics::v1::{
    Gauge, Metric, NumberDataPoint, metric::Data, number_data_point,
};
use opentelemetry_semantic_conventions::attribute::FAAS_INVOCATION_ID;
use serde_json::Value;

/// Report metric fields and their canonical gauge names.
const REPORT_FIELDS: [(&str, &str, &str, &str); 5] = [
    (
        "durationMs",
        "aws.lambda.duration",
        "ms",
        "Invocation duration reported by the platform",
    ),
    (
        "billedDurationMs",
        "aws.lambda.billed_duration",
        "ms",
        "Billed invocation duration",
    ),
    (
        "memorySizeMB",
        "aws.lambda.memory_size",
        "MB",
        "Configured function memory",
    ),
    (
        "maxMemoryUsedMB",
        "aws.lambda.max_memory_used",
        "MB",
        "Maximum memory used during the invocation",
    ),
    (
        "initDurationMs",
        "aws.lambda.init_duration",
        "ms",
        "Cold start initialization duration",
    ),
];

/// Translates a `platform.report` record into gauges, one per metric field
/// present in the record.
///
/// A record without a `metrics` object produces nothing; that is not an
/// error.
pub(crate) fn translate_report(record: &Value, time: DateTime<Utc>) -> Vec<Metric> {
    let Some(metrics) = record.get("metrics").and_then(Value::as_object) else {
        return Vec::new();
    };

    let timestamp = unix_nanos(time);
    let attributes = match record.get("requestId").and_then(Value::as_str) {
        Some(request_id) => vec![kv_string(FAAS_INVOCATION_ID, request_id)],
        None => Vec::new(),
    };

    REPORT_FIELDS
        .iter()
        .filter_map(|(field, name, unit, description)| {
            let value = metrics.get(*field)?.as_f64()?;
            Some(gauge(
                name,
                unit,
                description,
                value,
                timestamp,
                attributes.clone(),
            ))
        })
        .collect()
}

fn gauge(
    name: &str,
    unit: &str,
    description: &str,
    value: f64,
    timestamp: u64,
    attributes: Vec<KeyValue>,
) -> Metric {
    Metric {
        name: name.to_string(),
        description: description.to_string(),
        unit: unit.to_string(),
        data: Some(Data::Gauge(Gauge {
            data_points: vec![NumberDataPoint {
                attributes,
                start_time_unix_nano: timestamp,
                time_unix_nano: timestamp,
                value: Some(number_data_point::Value::AsDouble(value)),
                ..Default::default()
            }],
        })),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn names(metrics: &[Metric]) -> Vec<&str> {
        metrics.iter().map(|m| m.name.as_str()).collect()
    }

    fn gauge_value(metric: &Metric) -> f64 {
        match &metric.data {
            Some(Data::Gauge(gauge)) => match gauge.data_points[0].value {
                Some(number_data_point::Value::AsDouble(v)) => v,
                _ => panic!("expected double data point"),
            },
            _ => panic!("expected gauge"),
        }
    }

    #[test]
    fn emits_one_gauge_per_present_field() {
        let metrics = translate_report(
            &json!({
                "requestId": "req-1",
                "metrics": {"durationMs": 150.0, "memorySizeMB": 128.0}
            }),
            now(),
        );

        assert_eq!(metrics.len(), 2);
        assert_eq!(
            names(&metrics),
            vec!["aws.lambda.duration", "aws.lambda.memory_size"]
        );
        assert_eq!(gauge_value(&metrics[0]), 150.0);
        assert_eq!(metrics[0].unit, "ms");
        assert_eq!(metrics[1].unit, "MB");
    }

    #[test]
    fn covers_all_report_fields() {
        let metrics = translate_report(
            &json!({
                "requestId": "req-1",
                "metrics": {
                    "durationMs": 456.78,
                    "billedDurationMs": 500,
                    "memorySizeMB": 128,
                    "maxMemoryUsedMB": 64,
                    "initDurationMs": 234.56
                }
            }),
            now(),
        );

        assert_eq!(metrics.len(), 5);
        assert!(names(&metrics).contains(&"aws.lambda.billed_duration"));
        assert!(names(&metrics).contains(&"aws.lambda.init_duration"));
    }

    #[test]
    fn missing_metrics_object_emits_nothing() {
        assert!(translate_report(&json!({"requestId": "req-1"}), now()).is_empty());
        assert!(translate_report(&json!("not an object"), now()).is_empty());
        assert!(translate_report(&json!({"metrics": "bogus"}), now()).is_empty());
    }

    #[test]
    fn attaches_the_request_id_when_present() {
        let with_id = translate_report(
            &json!({"requestId": "req-1", "metrics": {"durationMs": 1.0}}),
            now(),
        );
        let point = match &with_id[0].data {
            Some(Data::Gauge(gauge)) => &gauge.data_points[0],
            _ => panic!("expected gauge"),
        };
        assert_eq!(point.attributes[0].key, "faas.invocation_id");

        let without_id = translate_report(&json!({"metrics": {"durationMs": 1.0}}), now());
        let point = match &without_id[0].data {
            Some(Data::Gauge(gauge)) => &gauge.data_points[0],
            _ => panic!("expected gauge"),
        };
        assert!(point.attributes.is_empty());
    }
}
