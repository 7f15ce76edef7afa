//! Receiver configuration and identity.
//!
//! The embedding process deserializes [`Config`] from its own configuration
//! tree and hands it to [`crate::factory::acquire`]. Two configurations with
//! equal [`Fingerprint`]s share one receiver instance.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Telemetry stream carrying platform lifecycle events.
pub const TYPE_PLATFORM: &str = "platform";
/// Telemetry stream carrying function stdout/stderr lines.
pub const TYPE_FUNCTION: &str = "function";
/// Telemetry stream carrying extension log lines.
pub const TYPE_EXTENSION: &str = "extension";

const DEFAULT_PORT: u16 = 4325;
const DEFAULT_MAX_ITEMS: u32 = 1000;
const DEFAULT_MAX_BYTES: u32 = 256 * 1024;
const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Configuration for one telemetry receiver.
///
/// `max_items`, `max_bytes` and `timeout_ms` are buffering hints forwarded
/// to the host during subscription; the receiver does not enforce them
/// locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port of the loopback intake listener.
    pub port: u16,
    /// Event classes to subscribe to; a subset of
    /// `{platform, function, extension}`.
    pub types: Vec<String>,
    /// Maximum number of events the host buffers before delivering.
    pub max_items: u32,
    /// Maximum number of bytes the host buffers before delivering.
    pub max_bytes: u32,
    /// Maximum time in milliseconds the host buffers before delivering.
    pub timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            types: vec![
                TYPE_PLATFORM.to_string(),
                TYPE_FUNCTION.to_string(),
                TYPE_EXTENSION.to_string(),
            ],
            max_items: DEFAULT_MAX_ITEMS,
            max_bytes: DEFAULT_MAX_BYTES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Checks that every `types` entry is a recognized telemetry stream.
    ///
    /// Duplicates and the empty list are valid; the numeric fields accept
    /// their full range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownType`] for the first entry outside the
    /// closed set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.types {
            match entry.as_str() {
                TYPE_PLATFORM | TYPE_FUNCTION | TYPE_EXTENSION => {}
                other => return Err(ConfigError::UnknownType(other.to_string())),
            }
        }
        Ok(())
    }

    /// Returns the value-equal identity of this configuration.
    pub(crate) fn fingerprint(&self) -> Fingerprint {
        let mut types = self.types.clone();
        types.sort();
        Fingerprint {
            port: self.port,
            types,
            max_items: self.max_items,
            max_bytes: self.max_bytes,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Value-equal identity of a receiver configuration.
///
/// The type list is compared order-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    port: u16,
    types: Vec<String>,
    max_items: u32,
    max_bytes: u32,
    timeout_ms: u32,
}
