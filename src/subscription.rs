//! Telemetry API subscription client and wire types.
//!
//! Registers the receiver's HTTP sink with the host Telemetry API during
//! start-up and withdraws the registration on shutdown. The wire contract
//! is documented at
//! <https://docs.aws.amazon.com/lambda/latest/dg/telemetry-api.html>.

use crate::config::Config;
use crate::error::SubscriptionError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
const EXTENSION_ID_ENV: &str = "AWS_LAMBDA_EXTENSION_IDENTIFIER";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const SCHEMA_VERSION: &str = "2022-07-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffering hints forwarded to the host.
///
/// The host enforces these; the receiver does not batch locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffering {
    /// Maximum number of events buffered before delivery.
    pub max_items: u32,
    /// Maximum number of bytes buffered before delivery.
    pub max_bytes: u32,
    /// Maximum buffering time in milliseconds.
    pub timeout_ms: u32,
}

/// Destination of the host's event push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    /// Transport protocol; only `HTTP` is supported.
    pub protocol: String,
    /// URI the host delivers event batches to.
    #[serde(rename = "URI")]
    pub uri: String,
}

/// Subscription request body for the Telemetry API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Telemetry API schema version.
    pub schema_version: String,
    /// Where the host should push events.
    pub destination: Destination,
    /// Event classes requested.
    pub types: Vec<String>,
    /// Buffering hints.
    pub buffering: Buffering,
}

impl SubscriptionRequest {
    /// Builds the subscription body for a receiver configuration.
    pub fn from_config(config: &Config, destination_uri: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            destination: Destination {
                protocol: "HTTP".to_string(),
                uri: destination_uri.into(),
            },
            types: config.types.clone(),
            buffering: Buffering {
                max_items: config.max_items,
                max_bytes: config.max_bytes,
                timeout_ms: config.timeout_ms,
            },
        }
    }
}

/// HTTP client for the host Telemetry API.
///
/// When `AWS_LAMBDA_RUNTIME_API` is unset the client runs detached:
/// [`subscribe`](TelemetryApiClient::subscribe) logs a warning and succeeds
/// without any HTTP call, which keeps the intake usable in tests and local
/// runs.
pub struct TelemetryApiClient {
    base_url: Option<String>,
    extension_id: String,
}

impl TelemetryApiClient {
    /// Creates a client from the process environment.
    pub fn from_env() -> Self {
        Self {
            base_url: env::var(RUNTIME_API_ENV).ok().filter(|v| !v.is_empty()),
            extension_id: env::var(EXTENSION_ID_ENV).unwrap_or_default(),
        }
    }

    /// Registers the destination with the host Telemetry API.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be sent or the host answers
    /// with any status other than 200. Both are fatal to receiver start-up.
    pub async fn subscribe(&self, request: &SubscriptionRequest) -> Result<(), SubscriptionError> {
        let Some(base) = &self.base_url else {
            tracing::warn!(
                "{} is not set, skipping telemetry api subscription",
                RUNTIME_API_ENV
            );
            return Ok(());
        };

        self.post(base, request).await?;
        tracing::info!(
            types = ?request.types,
            uri = %request.destination.uri,
            "subscribed to the telemetry api"
        );
        Ok(())
    }

    /// Withdraws the subscription by re-posting it with an empty type list.
    ///
    /// Best effort: failures are logged at warn level and swallowed.
    pub async fn unsubscribe(&self, request: &SubscriptionRequest) {
        let Some(base) = &self.base_url else {
            return;
        };

        let mut request = request.clone();
        request.types.clear();
        if let Err(error) = self.post(base, &request).await {
            tracing::warn!(error = %error, "telemetry api unsubscribe failed");
        }
    }

    async fn post(
        &self,
        base: &str,
        request: &SubscriptionRequest,
    ) -> Result<(), SubscriptionError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let response = client
            .post(format!("http://{base}/{SCHEMA_VERSION}/telemetry"))
            .header(EXTENSION_ID_HEADER, &self.extension_id)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SubscriptionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_the_documented_wire_shape() {
        let request = SubscriptionRequest::from_config(
            &Config::default(),
            "http://sandbox.localdomain:4325/",
        );

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "schemaVersion": "2022-07-01",
                "destination": {
                    "protocol": "HTTP",
                    "URI": "http://sandbox.localdomain:4325/"
                },
                "types": ["platform", "function", "extension"],
                "buffering": {
                    "maxItems": 1000,
                    "maxBytes": 262144,
                    "timeoutMs": 1000
                }
            })
        );
    }

    #[test]
    fn carries_the_configured_types_and_buffering() {
        let config = Config {
            types: vec!["platform".to_string()],
            max_items: 50,
            max_bytes: 1024,
            timeout_ms: 25,
            ..Config::default()
        };

        let request = SubscriptionRequest::from_config(&config, "http://sandbox.localdomain:4325/");
        assert_eq!(request.types, vec!["platform"]);
        assert_eq!(request.buffering.max_items, 50);
        assert_eq!(request.buffering.max_bytes, 1024);
        assert_eq!(request.buffering.timeout_ms, 25);
    }

    #[tokio::test]
    async fn detached_client_skips_subscription() {
        let (client, request) = temp_env::with_vars(
            [(RUNTIME_API_ENV, None::<&str>), (EXTENSION_ID_ENV, None)],
            || {
                let client = TelemetryApiClient::from_env();
                let request = SubscriptionRequest::from_config(
                    &Config::default(),
                    "http://sandbox.localdomain:4325/",
                );
                (client, request)
            },
        );

        assert!(client.subscribe(&request).await.is_ok());
        client.unsubscribe(&request).await;
    }

    #[test]
    fn empty_runtime_api_counts_as_detached() {
        temp_env::with_vars([(RUNTIME_API_ENV, Some(""))], || {
            let client = TelemetryApiClient::from_env();
            assert!(client.base_url.is_none());
        });
    }
}
