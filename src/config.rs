/**
 * config.rs
 *
 * Resolver timeouts: defaults, JSON files and environment overrides
 */

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How long to wait for the remote peer to answer an invite
pub const DEFAULT_SIGNALING_TIMEOUT: Duration = Duration::from_secs(20);

/// How long direct candidates get before relay is requested
pub const DEFAULT_PRIMARY_TIMEOUT: Duration = Duration::from_secs(18);

/// How long the relay gets before the resolution gives up
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(20);

pub const ENV_SIGNALING_TIMEOUT: &str = "PEERDIAL_SIGNALING_TIMEOUT_MS";
pub const ENV_PRIMARY_TIMEOUT: &str = "PEERDIAL_PRIMARY_TIMEOUT_MS";
pub const ENV_RELAY_TIMEOUT: &str = "PEERDIAL_RELAY_TIMEOUT_MS";

/// Resolver configuration
///
/// Serialized with durations in milliseconds:
/// `{"signaling_timeout_ms": 20000, "primary_timeout_ms": 18000, "relay_timeout_ms": 20000}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    #[serde(rename = "signaling_timeout_ms", with = "millis")]
    pub signaling_timeout: Duration,

    /// Trades connection latency against NAT traversal success rate
    #[serde(rename = "primary_timeout_ms", with = "millis")]
    pub primary_timeout: Duration,

    #[serde(rename = "relay_timeout_ms", with = "millis")]
    pub relay_timeout: Duration,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("invalid value {value:?} for {key}: expected milliseconds")]
    InvalidMillis { key: String, value: String },

    #[error("malformed resolver config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            signaling_timeout: DEFAULT_SIGNALING_TIMEOUT,
            primary_timeout: DEFAULT_PRIMARY_TIMEOUT,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }
}

impl ResolverConfig {
    pub fn with_signaling_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_timeout = timeout;
        self
    }

    pub fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = timeout;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("signaling_timeout_ms"));
        }
        if self.primary_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("primary_timeout_ms"));
        }
        if self.relay_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("relay_timeout_ms"));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Defaults overridden by `PEERDIAL_*_TIMEOUT_MS` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override timeouts from a key lookup (environment-style names)
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let slots = [
            (ENV_SIGNALING_TIMEOUT, &mut self.signaling_timeout),
            (ENV_PRIMARY_TIMEOUT, &mut self.primary_timeout),
            (ENV_RELAY_TIMEOUT, &mut self.relay_timeout),
        ];
        for (key, slot) in slots {
            if let Some(value) = lookup(key) {
                let millis = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidMillis {
                        key: key.to_string(),
                        value: value.clone(),
                    })?;
                *slot = Duration::from_millis(millis);
            }
        }
        self.validate()?;
        Ok(self)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
