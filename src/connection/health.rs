//! Connection health snapshot shared by the factory and the circuit breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Overall connection mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    /// Connection lost and at least one topic is served by polling
    Polling,
}

impl ConnectionStatus {
    /// Statuses that mean push channels can no longer be trusted
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed | ConnectionStatus::Polling
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Polling => "polling",
        };
        write!(f, "{label}")
    }
}

/// Current health of the shared connection
///
/// Invariant: `status == Connected` implies `failure_count == 0`, which in
/// turn keeps the derived circuit state CLOSED.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    /// Set when the circuit opens
    pub next_retry_at: Option<Instant>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connectivity test succeeded
    pub fn record_connected(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.failure_count = 0;
        self.next_retry_at = None;
        self.last_connected_at = Some(Utc::now());
    }

    /// A creation or probe attempt failed
    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    /// Remaining cool-down before the next attempt may run
    pub fn retry_after(&self, now: Instant) -> Option<Duration> {
        self.next_retry_at
            .map(|at| at.saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Back to the state of a freshly created process
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_resets_failures() {
        let mut health = ConnectionHealth::new();
        health.record_failure();
        health.record_failure();
        health.next_retry_at = Some(Instant::now());
        assert_eq!(health.failure_count, 2);

        health.record_connected();
        assert_eq!(health.status, ConnectionStatus::Connected);
        assert_eq!(health.failure_count, 0);
        assert!(health.next_retry_at.is_none());
        assert!(health.last_connected_at.is_some());
    }

    #[test]
    fn test_retry_after() {
        let now = Instant::now();
        let mut health = ConnectionHealth::new();
        assert_eq!(health.retry_after(now), None);

        health.next_retry_at = Some(now + Duration::from_secs(5));
        assert_eq!(health.retry_after(now), Some(Duration::from_secs(5)));
        assert_eq!(health.retry_after(now + Duration::from_secs(6)), None);
    }

    #[test]
    fn test_degraded_statuses() {
        assert!(ConnectionStatus::Failed.is_degraded());
        assert!(ConnectionStatus::Disconnected.is_degraded());
        assert!(ConnectionStatus::Polling.is_degraded());
        assert!(!ConnectionStatus::Connected.is_degraded());
        assert!(!ConnectionStatus::Connecting.is_degraded());
        assert_eq!(ConnectionStatus::Polling.to_string(), "polling");
    }
}
