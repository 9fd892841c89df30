//! # Realtime Sync Configuration
//!
//! Every tunable of the synchronization layer lives in [`SyncConfig`]. All
//! fields have defaults, so a partial file or a handful of environment
//! variables is enough to override what matters.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use realtime_sync::config::{ConfigLoader, SyncConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Defaults layered with realtime-sync.yaml and REALTIME_SYNC_* variables
//! let config = ConfigLoader::new().with_file("realtime-sync.yaml").load()?;
//! assert!(config.max_retries > 0);
//!
//! // Or build one in code
//! let config = SyncConfig::default()
//!     .with_max_retries(5)
//!     .with_polling_interval_ms(2_000);
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Where the backend lives. Passed untouched to the client factory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendEndpoint {
    pub url: String,
    pub api_key: String,
}

impl BackendEndpoint {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

/// Connection, circuit breaker and transport timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backend location handed to the client factory
    pub endpoint: BackendEndpoint,

    /// Connection attempts per `get_connection` call
    pub max_retries: u32,

    /// First backoff delay; doubles per attempt
    pub base_retry_delay_ms: u64,

    /// Upper bound for a single backoff delay, also the circuit cool-down
    pub max_retry_delay_ms: u64,

    /// Upper bound (exclusive) of the uniform jitter added to each delay
    pub max_jitter_ms: u64,

    /// Failure count at which the circuit opens
    pub circuit_breaker_threshold: u32,

    /// Timeout for a single connectivity probe
    pub probe_timeout_ms: u64,

    /// Background probe interval for the cached connection
    pub health_check_interval_ms: u64,

    /// How long a push channel may take to confirm its subscription
    pub subscribe_timeout_ms: u64,

    /// Poll transport tick interval
    pub polling_interval_ms: u64,

    /// Interval between attempts to move polling topics back to push
    pub reconnection_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: BackendEndpoint::default(),
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            max_jitter_ms: 1_000,
            circuit_breaker_threshold: 5,
            probe_timeout_ms: 10_000,
            health_check_interval_ms: 30_000,
            subscribe_timeout_ms: 10_000,
            polling_interval_ms: 5_000,
            reconnection_interval_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: BackendEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.base_retry_delay_ms = base;
        self.max_retry_delay_ms = max;
        self
    }

    pub fn with_max_jitter_ms(mut self, jitter: u64) -> Self {
        self.max_jitter_ms = jitter;
        self
    }

    pub fn with_circuit_breaker_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker_threshold = threshold;
        self
    }

    pub fn with_probe_timeout_ms(mut self, timeout: u64) -> Self {
        self.probe_timeout_ms = timeout;
        self
    }

    pub fn with_health_check_interval_ms(mut self, interval: u64) -> Self {
        self.health_check_interval_ms = interval;
        self
    }

    pub fn with_subscribe_timeout_ms(mut self, timeout: u64) -> Self {
        self.subscribe_timeout_ms = timeout;
        self
    }

    pub fn with_polling_interval_ms(mut self, interval: u64) -> Self {
        self.polling_interval_ms = interval;
        self
    }

    pub fn with_reconnection_interval_ms(mut self, interval: u64) -> Self {
        self.reconnection_interval_ms = interval;
        self
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn reconnection_interval(&self) -> Duration {
        Duration::from_millis(self.reconnection_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_retries == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_retries",
                "0",
                "at least one connection attempt is required",
            ));
        }

        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker_threshold",
                "0",
                "threshold must be greater than 0",
            ));
        }

        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "base_retry_delay_ms",
                self.base_retry_delay_ms.to_string(),
                format!(
                    "must not exceed max_retry_delay_ms ({})",
                    self.max_retry_delay_ms
                ),
            ));
        }

        let intervals = [
            ("max_retry_delay_ms", self.max_retry_delay_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("subscribe_timeout_ms", self.subscribe_timeout_ms),
            ("polling_interval_ms", self.polling_interval_ms),
            ("reconnection_interval_ms", self.reconnection_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "0",
                    "interval must be greater than 0",
                ));
            }
        }

        Ok(())
    }
}
