//! # Circuit Breaker Implementation
//!
//! Gates new connection attempts so a degraded backend does not cause retry
//! storms. The breaker stores no state of its own beyond the half-open probe
//! slot: Closed, Open and Half-Open are derived from [`ConnectionHealth`].
//!
//! - **Closed**: `failure_count < threshold`, attempts proceed.
//! - **Open**: `failure_count >= threshold` and `now < next_retry_at`, attempts
//!   are rejected without touching the network.
//! - **Half-Open**: `failure_count >= threshold` and the cool-down elapsed,
//!   exactly one probing attempt is admitted.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::connection::health::ConnectionHealth;
use crate::error::{SyncError, SyncResult, CIRCUIT_OPEN_REASON};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all attempts are allowed through
    Closed,
    /// Failure mode - attempts fail fast without executing
    Open,
    /// Testing recovery - a single attempt is allowed
    HalfOpen,
}

/// How an attempt was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit, the full retry sequence may run
    Normal,
    /// Half-open circuit, a single probing attempt
    Probe,
}

/// Threshold-based breaker over the shared connection health
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cool_down: Duration,
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cool_down: Duration) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold,
            cool_down_ms = cool_down.as_millis() as u64,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            cool_down,
            probe_in_flight: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }

    /// Derive the circuit state from a health snapshot
    pub fn state(&self, health: &ConnectionHealth, now: Instant) -> CircuitState {
        if health.failure_count < self.failure_threshold {
            return CircuitState::Closed;
        }

        match health.next_retry_at {
            Some(retry_at) if now < retry_at => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Decide whether an attempt may run
    ///
    /// Admitting the half-open probe halves the failure count; the probe's
    /// outcome is reported through [`record_success`](Self::record_success)
    /// or [`record_failure`](Self::record_failure).
    pub fn admit(&self, health: &mut ConnectionHealth, now: Instant) -> SyncResult<Admission> {
        match self.state(health, now) {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => Err(self.rejection(health, now)),
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(self.rejection(health, now));
                }

                health.failure_count /= 2;
                info!(
                    component = %self.name,
                    failure_count = health.failure_count,
                    "🟡 Circuit breaker half-open (testing recovery)"
                );
                Ok(Admission::Probe)
            }
        }
    }

    /// An admitted attempt connected successfully
    pub fn record_success(&self, health: &mut ConnectionHealth, admission: Admission) {
        health.record_connected();
        if admission == Admission::Probe {
            self.probe_in_flight.store(false, Ordering::Release);
            info!(component = %self.name, "🟢 Circuit breaker closed (recovered)");
        }
    }

    /// An admitted attempt failed. Returns true when the circuit is now open.
    pub fn record_failure(
        &self,
        health: &mut ConnectionHealth,
        admission: Admission,
        now: Instant,
    ) -> bool {
        health.record_failure();

        if admission == Admission::Probe {
            self.probe_in_flight.store(false, Ordering::Release);
            health.failure_count = health.failure_count.max(self.failure_threshold);
            self.trip(health, now);
            return true;
        }

        if health.failure_count >= self.failure_threshold {
            self.trip(health, now);
            return true;
        }

        false
    }

    /// A background probe of an established connection failed
    ///
    /// The count saturates one below the threshold: decay alone never opens
    /// the circuit, but the next failed attempt will.
    pub fn record_decay(&self, health: &mut ConnectionHealth) {
        let ceiling = self.failure_threshold.saturating_sub(1);
        health.failure_count = health.failure_count.saturating_add(1).min(ceiling);
        warn!(
            component = %self.name,
            failure_count = health.failure_count,
            "Connection health decayed"
        );
    }

    /// Open the circuit for a fresh cool-down period
    pub fn trip(&self, health: &mut ConnectionHealth, now: Instant) {
        health.next_retry_at = Some(now + self.cool_down);
        error!(
            component = %self.name,
            failure_count = health.failure_count,
            failure_threshold = self.failure_threshold,
            cool_down_ms = self.cool_down.as_millis() as u64,
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    /// Release a half-open probe slot without an outcome (attempt abandoned)
    pub fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Force the breaker closed (used on teardown)
    pub fn reset(&self, health: &mut ConnectionHealth) {
        warn!(component = %self.name, "🚨 Circuit breaker reset");
        self.probe_in_flight.store(false, Ordering::Release);
        health.reset();
    }

    fn rejection(&self, health: &ConnectionHealth, now: Instant) -> SyncError {
        SyncError::connection_unavailable(CIRCUIT_OPEN_REASON, health.retry_after(now))
    }
}
