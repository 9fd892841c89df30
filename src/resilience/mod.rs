//! # Resilience Module
//!
//! Fault tolerance primitives used by the connection factory: a circuit
//! breaker whose state is derived from the shared connection health, and an
//! exponential backoff policy with bounded jitter.
//!
//! ## Usage
//!
//! ```rust
//! use realtime_sync::connection::ConnectionHealth;
//! use realtime_sync::resilience::{Admission, CircuitBreaker, CircuitState};
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! let breaker = CircuitBreaker::new("realtime", 2, Duration::from_secs(30));
//! let mut health = ConnectionHealth::new();
//! let now = Instant::now();
//!
//! breaker.record_failure(&mut health, Admission::Normal, now);
//! breaker.record_failure(&mut health, Admission::Normal, now);
//! assert_eq!(breaker.state(&health, now), CircuitState::Open);
//! assert!(breaker.admit(&mut health, now).is_err());
//! ```

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
