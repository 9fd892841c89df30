//! # Backend Capability
//!
//! The realtime backend is consumed through three small traits. The wire
//! protocol behind them is opaque to this crate: a client can be created and
//! probed, it can open a named channel that streams row-level change events,
//! and it can run a one-shot query against a resource.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::BackendEndpoint;
use crate::error::SyncResult;

/// A row as delivered by the backend
pub type Row = serde_json::Value;

/// Row-level change kinds reported by a push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which change kinds a channel listens for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEventFilter {
    #[default]
    All,
    Only(ChangeKind),
}

impl ChangeEventFilter {
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            ChangeEventFilter::All => true,
            ChangeEventFilter::Only(expected) => *expected == kind,
        }
    }
}

/// Which transport produced an event or currently serves a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Push,
    Poll,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Push => write!(f, "push"),
            TransportKind::Poll => write!(f, "poll"),
        }
    }
}

/// Opaque selector for the data behind a topic: a table or stream plus an
/// optional filter expression understood by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSelector {
    pub table: String,
    pub filter: Option<String>,
    #[serde(default)]
    pub events: ChangeEventFilter,
}

impl ResourceSelector {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            events: ChangeEventFilter::All,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_events(mut self, events: ChangeEventFilter) -> Self {
        self.events = events;
        self
    }

    /// Name of the push channel serving `key`
    pub fn channel_topic(key: &str) -> String {
        format!("realtime:{key}")
    }
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}?{}", self.table, filter),
            None => write!(f, "{}", self.table),
        }
    }
}

/// A change notification delivered to a topic handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: String,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
    pub source: TransportKind,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Event as reported by a push channel
    pub fn pushed(topic: impl Into<String>, kind: ChangeKind, new: Option<Row>, old: Option<Row>) -> Self {
        Self {
            topic: topic.into(),
            kind,
            new,
            old,
            source: TransportKind::Push,
            received_at: Utc::now(),
        }
    }

    /// Event synthesized by the poll transport after a snapshot changed
    ///
    /// Polling only detects that something changed. Query results are in
    /// storage order, oldest row first, so `new` carries the last row of the
    /// result; `old` is never populated.
    pub fn polled(topic: impl Into<String>, rows: &[Row]) -> Self {
        Self {
            topic: topic.into(),
            kind: ChangeKind::Update,
            new: rows.last().cloned(),
            old: None,
            source: TransportKind::Poll,
            received_at: Utc::now(),
        }
    }
}

/// Subscription status reported by a push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ChannelStatus::Subscribed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Subscribed => write!(f, "SUBSCRIBED"),
            ChannelStatus::ChannelError(message) => write!(f, "CHANNEL_ERROR: {message}"),
            ChannelStatus::TimedOut => write!(f, "TIMED_OUT"),
            ChannelStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Everything a channel can report after it has been opened
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Change(ChangeEvent),
    Status(ChannelStatus),
}

/// Where a channel delivers its events
pub type ChannelSink = mpsc::UnboundedSender<ChannelEvent>;

/// Creates backend clients (`createClient(url, key)`)
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create_client(&self, endpoint: &BackendEndpoint) -> SyncResult<Arc<dyn RealtimeClient>>;
}

/// A live backend client
#[async_trait]
pub trait RealtimeClient: Send + Sync {
    /// Cheap connectivity check
    async fn probe(&self) -> SyncResult<()>;

    /// Open a named channel for `resource`, register the change listener and
    /// subscribe. Status and change events arrive through `sink`.
    async fn open_channel(
        &self,
        topic: &str,
        resource: &ResourceSelector,
        sink: ChannelSink,
    ) -> SyncResult<Box<dyn RealtimeChannel>>;

    /// Run a one-shot query against `resource`
    ///
    /// Rows come back in storage order, oldest first.
    async fn query(&self, resource: &ResourceSelector) -> SyncResult<Vec<Row>>;
}

impl fmt::Debug for dyn RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient").finish_non_exhaustive()
    }
}

/// An open push channel
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn topic(&self) -> &str;

    async fn unsubscribe(&self) -> SyncResult<()>;
}
