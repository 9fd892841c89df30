//! Exponential backoff with bounded jitter for connection retries.

use std::time::Duration;

use crate::config::SyncConfig;

/// `min(base * 2^(attempt-1) + jitter, max)`
///
/// Jitter is drawn uniformly from `[0, min(max_jitter, base))`. Keeping it
/// below `base` makes consecutive delays non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    max_jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            max_jitter,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.base_retry_delay(),
            config.max_retry_delay(),
            config.max_jitter(),
        )
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Delay before retrying after failed `attempt` (1-based), with jitter
    /// taken as `jitter_fraction` of the jitter window (`0.0..1.0`).
    pub fn delay_for(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << exponent);

        let window_ms = self.max_jitter.min(self.base).as_millis() as f64;
        let jitter_ms = (window_ms * jitter_fraction.clamp(0.0, 1.0)) as u64;
        let jitter_ms = jitter_ms.min((window_ms as u64).saturating_sub(1));

        let delay_ms = exponential_ms.saturating_add(jitter_ms);
        Duration::from_millis(delay_ms).min(self.max)
    }

    /// Delay with a random jitter sample
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, fastrand::f64())
    }
}
