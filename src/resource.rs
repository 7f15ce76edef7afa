//! Lambda resource attribute detection.
//!
//! Builds the immutable resource descriptor attached to every emitted
//! signal. Attributes are read from the Lambda runtime environment once at
//! receiver construction and follow OpenTelemetry semantic conventions for
//! cloud and FaaS attributes.

use opentelemetry::{KeyValue, Value};
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue as ProtoKeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_sdk::resource::{Resource, ResourceDetector};
use opentelemetry_semantic_conventions::attribute as semconv_attr;
use opentelemetry_semantic_conventions::resource as semconv_res;
use std::env;

const AWS_LAMBDA_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";
const AWS_LAMBDA_FUNCTION_MEMORY_SIZE: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
const AWS_LAMBDA_FUNCTION_VERSION: &str = "AWS_LAMBDA_FUNCTION_VERSION";
const AWS_REGION: &str = "AWS_REGION";
const LOGZIO_ENV_ID: &str = "LOGZIO_ENV_ID";

/// Resource attribute carrying the deployment environment label.
const ENV_ID: &str = "env_id";
/// Service name used when the function name variable is unset or empty.
const UNKNOWN_SERVICE: &str = "unknown_service";

/// AWS Lambda resource detector.
///
/// Reads the following environment variables:
/// - `AWS_LAMBDA_FUNCTION_NAME` - `service.name` and `faas.name`
/// - `AWS_LAMBDA_FUNCTION_MEMORY_SIZE` - memory in MB, converted to bytes for `faas.max_memory`
/// - `AWS_LAMBDA_FUNCTION_VERSION` - `faas.version`
/// - `AWS_REGION` - `cloud.region`
/// - `LOGZIO_ENV_ID` - `env_id`
///
/// `service.name` falls back to `unknown_service` when the function name is
/// unavailable; other missing variables are omitted.
#[derive(Debug, Default)]
pub struct LambdaResourceDetector;

impl ResourceDetector for LambdaResourceDetector {
    fn detect(&self) -> Resource {
        let function_name = env::var(AWS_LAMBDA_FUNCTION_NAME).unwrap_or_default();
        let service_name = if function_name.is_empty() {
            UNKNOWN_SERVICE.to_string()
        } else {
            function_name.clone()
        };

        let mut attributes = vec![
            KeyValue::new(semconv_attr::CLOUD_PROVIDER, "aws"),
            KeyValue::new(semconv_res::SERVICE_NAME, service_name),
        ];

        if !function_name.is_empty() {
            attributes.push(KeyValue::new(semconv_attr::FAAS_NAME, function_name));
        }

        if let Ok(memory) = env::var(AWS_LAMBDA_FUNCTION_MEMORY_SIZE)
            && let Ok(mb) = memory.parse::<i64>()
        {
            attributes.push(KeyValue::new(
                semconv_attr::FAAS_MAX_MEMORY,
                mb * 1024 * 1024,
            ));
        }

        if let Ok(version) = env::var(AWS_LAMBDA_FUNCTION_VERSION) {
            attributes.push(KeyValue::new(semconv_attr::FAAS_VERSION, version));
        }

        if let Ok(region) = env::var(AWS_REGION) {
            attributes.push(KeyValue::new(semconv_attr::CLOUD_REGION, region));
        }

        if let Ok(env_id) = env::var(LOGZIO_ENV_ID) {
            attributes.push(KeyValue::new(ENV_ID, env_id));
        }

        Resource::builder_empty().with_attributes(attributes).build()
    }
}

/// Detects the Lambda environment and freezes it into an OTLP resource.
pub fn detect_resource() -> ProtoResource {
    to_proto(&LambdaResourceDetector.detect())
}

fn to_proto(resource: &Resource) -> ProtoResource {
    ProtoResource {
        attributes: resource
            .iter()
            .map(|(key, value)| ProtoKeyValue {
                key: key.to_string(),
                value: Some(to_proto_value(value)),
            })
            .collect(),
        ..Default::default()
    }
}

fn to_proto_value(value: &Value) -> AnyValue {
    let value = match value {
        Value::Bool(b) => any_value::Value::BoolValue(*b),
        Value::I64(i) => any_value::Value::IntValue(*i),
        Value::F64(f) => any_value::Value::DoubleValue(*f),
        other => any_value::Value::StringValue(other.to_string()),
    };
    AnyValue { value: Some(value) }
}
