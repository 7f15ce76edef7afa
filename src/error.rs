//! Error types for the telemetry receiver.

use thiserror::Error;

/// Errors raised while validating receiver configuration.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `types` entry is outside the closed set understood by the Telemetry API.
    #[error("unknown extension type: {0}")]
    UnknownType(String),
}

/// Errors raised by the Telemetry API subscription handshake.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The HTTP request to the host could not be performed.
    #[error("telemetry subscription request failed")]
    Http(#[from] reqwest::Error),

    /// The host rejected the subscription.
    #[error("telemetry subscription returned {status}: {body}")]
    Status {
        /// HTTP status code returned by the host.
        status: u16,
        /// Response body returned by the host.
        body: String,
    },
}

/// Errors that are fatal to receiver start-up.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The Telemetry API subscription handshake failed.
    #[error("failed to subscribe to the telemetry api")]
    Subscription(#[source] SubscriptionError),

    /// The intake listener could not be bound.
    #[error("failed to bind telemetry listener on {addr}")]
    Listener {
        /// Address the receiver attempted to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_message_names_the_offender() {
        let err = ConfigError::UnknownType("telemetry".to_string());
        assert_eq!(err.to_string(), "unknown extension type: telemetry");
    }

    #[test]
    fn listener_error_carries_the_address() {
        let err = ReceiverError::Listener {
            addr: "sandbox.localdomain:4325".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("sandbox.localdomain:4325"));
    }
}
