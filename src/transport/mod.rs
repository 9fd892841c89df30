//! # Topic Transports
//!
//! A transport delivers one topic's change notifications. Two strategies
//! share the same open/close capability:
//!
//! - [`PushTransport`]: a persistent backend channel streaming row events
//! - [`PollTransport`]: a timer that re-queries the resource and synthesizes
//!   an event whenever the result differs from the last snapshot
//!
//! Failures discovered after a transport is open are reported as
//! [`TransportFailure`] messages so the registry can react on its own loop.

pub mod poll;
pub mod push;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::backend::TransportKind;
use crate::error::{SyncError, SyncResult};
use crate::subscription::SubscriptionConfig;

pub use poll::{PollHandle, PollTransport, SnapshotCache};
pub use push::{PushHandle, PushTransport};

/// A transport-level failure for one topic, discovered after setup
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub key: String,
    pub generation: u64,
    pub kind: TransportKind,
    pub error: SyncError,
}

pub type FailureSender = mpsc::UnboundedSender<TransportFailure>;

/// Set once a subscription instance is unsubscribed, replaced or torn down
#[derive(Debug, Clone, Default)]
pub struct RetiredFlag(Arc<AtomicBool>);

impl RetiredFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything a transport needs to serve one topic
#[derive(Clone)]
pub struct TopicContext {
    pub subscription: Arc<SubscriptionConfig>,
    /// Identifies this subscription instance; stale failures are ignored
    pub generation: u64,
    pub failures: FailureSender,
    /// Handlers are not called once this is set
    pub retired: RetiredFlag,
}

impl TopicContext {
    pub fn key(&self) -> &str {
        &self.subscription.key
    }

    pub fn is_retired(&self) -> bool {
        self.retired.is_retired()
    }

    pub(crate) fn report_failure(&self, kind: TransportKind, error: SyncError) {
        let failure = TransportFailure {
            key: self.subscription.key.clone(),
            generation: self.generation,
            kind,
            error,
        };
        // The registry loop is gone only during teardown
        let _ = self.failures.send(failure);
    }
}

/// Open/close capability shared by both transports
#[async_trait]
pub trait TransportStrategy: Send + Sync {
    type Handle: Send;

    fn kind(&self) -> TransportKind;

    /// Start delivering the topic's changes
    async fn open(&self, topic: &TopicContext) -> SyncResult<Self::Handle>;

    /// Stop delivering and release the handle's resources
    async fn close(&self, handle: Self::Handle);
}

/// Counters shared by a transport's handles
#[derive(Debug, Default)]
pub struct TransportStats {
    pub opened: AtomicU64,
    pub closed: AtomicU64,
    pub open_failures: AtomicU64,
    pub changes_delivered: AtomicU64,
    pub poll_ticks: AtomicU64,
    pub poll_errors: AtomicU64,
    /// Handles currently live (open channels or running timers)
    pub live: AtomicUsize,
}

/// Serializable view of [`TransportStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStatsSnapshot {
    pub opened: u64,
    pub closed: u64,
    pub open_failures: u64,
    pub changes_delivered: u64,
    pub poll_ticks: u64,
    pub poll_errors: u64,
    pub live: usize,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            changes_delivered: self.changes_delivered.load(Ordering::Relaxed),
            poll_ticks: self.poll_ticks.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            live: self.live.load(Ordering::Relaxed),
        }
    }
}
