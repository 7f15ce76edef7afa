//! Shared receiver factory.
//!
//! Pipelines that declare the same configuration fingerprint share one
//! receiver instance, so one loopback listener serves however many signal
//! pipelines the embedding process wires up. The registry is the only
//! process-wide mutable state.

use crate::config::{Config, Fingerprint};
use crate::error::{ConfigError, ReceiverError};
use crate::receiver::TelemetryReceiver;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

static REGISTRY: OnceLock<Mutex<HashMap<Fingerprint, Arc<TelemetryReceiver>>>> = OnceLock::new();

fn registry() -> MutexGuard<'static, HashMap<Fingerprint, Arc<TelemetryReceiver>>> {
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Validates the configuration and returns the shared receiver for its
/// fingerprint, constructing one on first use.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownType`] when `types` contains a value
/// outside `{platform, function, extension}`.
pub fn acquire(config: &Config) -> Result<SharedReceiver, ConfigError> {
    config.validate()?;
    let fingerprint = config.fingerprint();
    let receiver = registry()
        .entry(fingerprint.clone())
        .or_insert_with(|| Arc::new(TelemetryReceiver::new(config.clone())))
        .clone();
    Ok(SharedReceiver {
        fingerprint,
        receiver,
    })
}

fn release(fingerprint: &Fingerprint) {
    registry().remove(fingerprint);
}

/// Handle to a receiver shared across signal pipelines.
///
/// Start and stop are refcounted: the listener starts with the first
/// pipeline and shuts down when the last one stops, at which point the
/// registry entry is removed.
#[derive(Clone)]
pub struct SharedReceiver {
    fingerprint: Fingerprint,
    receiver: Arc<TelemetryReceiver>,
}

impl SharedReceiver {
    /// Starts the underlying receiver for this pipeline.
    ///
    /// # Errors
    ///
    /// Surfaces bind and subscription failures from the first start.
    pub async fn start(&self) -> Result<(), ReceiverError> {
        Arc::clone(&self.receiver).start().await
    }

    /// Stops the underlying receiver for this pipeline, waiting up to
    /// `timeout` for the listener to drain when this was the last one.
    pub async fn stop(&self, timeout: Duration) {
        if self.receiver.stop(timeout).await {
            release(&self.fingerprint);
        }
    }

    /// True when both handles refer to the same underlying receiver.
    pub fn same_instance(&self, other: &SharedReceiver) -> bool {
        Arc::ptr_eq(&self.receiver, &other.receiver)
    }
}

impl Deref for SharedReceiver {
    type Target = TelemetryReceiver;

    fn deref(&self) -> &TelemetryReceiver {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> Config {
        Config {
            port,
            ..Config::default()
        }
    }

    #[test]
    fn equal_fingerprints_share_one_receiver() {
        let a = acquire(&config(34325)).unwrap();
        let b = acquire(&config(34325)).unwrap();
        assert!(a.same_instance(&b));
    }

    #[test]
    fn type_order_does_not_split_the_fingerprint() {
        let a = acquire(&Config {
            port: 34326,
            types: vec!["platform".to_string(), "function".to_string()],
            ..Config::default()
        })
        .unwrap();
        let b = acquire(&Config {
            port: 34326,
            types: vec!["function".to_string(), "platform".to_string()],
            ..Config::default()
        })
        .unwrap();
        assert!(a.same_instance(&b));
    }

    #[test]
    fn differing_fields_produce_distinct_receivers() {
        let a = acquire(&config(34327)).unwrap();
        let b = acquire(&config(34328)).unwrap();
        let c = acquire(&Config {
            port: 34327,
            max_items: 5,
            ..Config::default()
        })
        .unwrap();
        assert!(!a.same_instance(&b));
        assert!(!a.same_instance(&c));
    }

    #[test]
    fn invalid_config_is_rejected_before_registration() {
        let result = acquire(&Config {
            port: 34329,
            types: vec!["bogus".to_string()],
            ..Config::default()
        });
        assert!(matches!(result, Err(ConfigError::UnknownType(t)) if t == "bogus"));
    }

    #[tokio::test]
    async fn last_stop_releases_the_registry_entry() {
        let first = acquire(&config(34330)).unwrap();
        // Never started: stop is a no-op and must keep the entry.
        first.stop(Duration::from_millis(100)).await;
        let second = acquire(&config(34330)).unwrap();
        assert!(first.same_instance(&second));
    }
}
