#![allow(clippy::doc_markdown)] // Allow technical terms in docs without backticks
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Realtime Sync Core
//!
//! Resilient realtime data synchronization against a hosted backend.
//!
//! ## Overview
//!
//! The layer keeps one shared, health-checked backend connection and a set
//! of per-topic subscriptions. Each topic is served by a persistent push
//! channel when the backend is healthy and by a polling timer when it is
//! not; topics move back to push automatically once the connection recovers.
//!
//! ## Architecture
//!
//! - **Connection health**: one shared record of status, failures and
//!   cool-down, read by everything and written only by the factory.
//! - **Circuit breaker**: gates connection attempts so a degraded backend
//!   does not cause retry storms.
//! - **Connection factory**: single-flight connection attempts with
//!   exponential backoff, plus a background health probe.
//! - **Transports**: push (backend channel) and poll (interval query with
//!   snapshot comparison) behind one open/close capability.
//! - **Subscription registry**: owns desired subscriptions, performs
//!   failover to polling and recovery back to push.
//! - **Reconnection scheduler**: retries push recovery while any topic polls.
//!
//! ## Module Organization
//!
//! - [`backend`] - Traits the realtime backend is consumed through
//! - [`config`] - Options, validation and layered loading
//! - [`connection`] - Connection health and the connection factory
//! - [`resilience`] - Circuit breaker and backoff policy
//! - [`transport`] - Push and poll transports
//! - [`subscription`] - Topic handlers and the subscription registry
//! - [`reconnection`] - Periodic push recovery
//! - [`service`] - The [`RealtimeSync`] facade
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use realtime_sync::{RealtimeSync, ResourceSelector, SyncConfig};
//! # use realtime_sync::backend::ClientFactory;
//! # use std::sync::Arc;
//!
//! # async fn example(client_factory: Arc<dyn ClientFactory>) -> realtime_sync::SyncResult<()> {
//! realtime_sync::logging::init_structured_logging();
//!
//! let sync = RealtimeSync::new(SyncConfig::default(), client_factory)?;
//! sync.initialize()?;
//! sync.subscribe_with("notifications", ResourceSelector::table("notifications"), |event| {
//!     println!("{:?} {:?}", event.kind, event.new);
//! })
//! .await?;
//!
//! let report = sync.connection_status();
//! println!("{} topics, {} polling", report.active_topic_count, report.polling_topic_count);
//! sync.destroy().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Timer-driven behavior is tested with a paused Tokio clock against an
//! in-memory backend:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod reconnection;
pub mod resilience;
pub mod service;
pub mod subscription;
pub mod transport;

pub use backend::{
    ChangeEvent, ChangeEventFilter, ChangeKind, ClientFactory, RealtimeChannel, RealtimeClient,
    ResourceSelector, Row, TransportKind,
};
pub use config::{BackendEndpoint, ConfigLoader, ConfigurationError, SyncConfig};
pub use connection::{ConnectionFactory, ConnectionHealth, ConnectionStatus};
pub use error::{SyncError, SyncResult};
pub use reconnection::ReconnectionScheduler;
pub use resilience::{BackoffPolicy, CircuitBreaker, CircuitState};
pub use service::{ConnectionStatusReport, RealtimeSync};
pub use subscription::{
    CallbackHandler, RegistryMode, RegistryStatus, SubscriptionConfig, SubscriptionRegistry,
    TopicHandler,
};
pub use transport::{PollTransport, PushTransport, TransportStrategy};
