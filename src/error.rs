//! # Error Types
//!
//! Structured error handling for the synchronization layer using thiserror.
//! Errors are `Clone` because a single connection attempt is awaited by many
//! callers and a single failure may be reported to several topic handlers.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigurationError;

/// Errors produced by the realtime synchronization layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The backend client could not be constructed
    #[error("Client creation failed: {message}")]
    ClientCreation { message: String },

    /// The connectivity probe reported a failure
    #[error("Connectivity probe failed: {message}")]
    Probe { message: String },

    /// The connectivity probe did not answer in time
    #[error("Connectivity probe timed out after {timeout_ms}ms")]
    ProbeTimeout { timeout_ms: u64 },

    /// No connection can be handed out: retries exhausted or circuit open
    #[error("Connection unavailable: {reason}")]
    ConnectionUnavailable {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// A topic's push channel could not be opened
    #[error("Subscription open failed for topic {key}: {message}")]
    SubscriptionOpen { key: String, message: String },

    /// A single poll tick failed to query its resource
    #[error("Poll query failed for topic {key}: {message}")]
    PollQuery { key: String, message: String },

    /// An established push channel reported an error or closed
    #[error("Channel for topic {key} closed: {message}")]
    ChannelClosed { key: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The layer has been destroyed
    #[error("Realtime sync has been shut down")]
    ShutDown,
}

impl SyncError {
    pub fn client_creation(message: impl Into<String>) -> Self {
        Self::ClientCreation {
            message: message.into(),
        }
    }

    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe {
            message: message.into(),
        }
    }

    pub fn connection_unavailable(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::ConnectionUnavailable {
            reason: reason.into(),
            retry_after,
        }
    }

    pub fn subscription_open(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubscriptionOpen {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn poll_query(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PollQuery {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn channel_closed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            key: key.into(),
            message: message.into(),
        }
    }

    /// True when the error was produced by an open circuit without touching the network
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::ConnectionUnavailable { reason, .. } if reason == CIRCUIT_OPEN_REASON)
    }

    /// Remaining cool-down carried by a `ConnectionUnavailable` error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Errors that describe the shared connection rather than a single topic
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ClientCreation { .. }
                | Self::Probe { .. }
                | Self::ProbeTimeout { .. }
                | Self::ConnectionUnavailable { .. }
        )
    }
}

/// Reason string carried by `ConnectionUnavailable` when the breaker rejects a call
pub const CIRCUIT_OPEN_REASON: &str = "circuit open";

impl From<ConfigurationError> for SyncError {
    fn from(error: ConfigurationError) -> Self {
        SyncError::Configuration(error.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
