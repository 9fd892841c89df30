//! # Realtime Sync Service
//!
//! Composition root for the synchronization layer. Owns the connection
//! factory and the subscription registry (which owns the reconnection
//! scheduler) and exposes the application-facing lifecycle:
//!
//! ```rust,no_run
//! use realtime_sync::{RealtimeSync, ResourceSelector, SubscriptionConfig, SyncConfig};
//! # use realtime_sync::backend::ClientFactory;
//! # use std::sync::Arc;
//!
//! # async fn example(client_factory: Arc<dyn ClientFactory>) -> realtime_sync::SyncResult<()> {
//! let sync = RealtimeSync::new(SyncConfig::default(), client_factory)?;
//! sync.initialize()?;
//!
//! sync.subscribe(SubscriptionConfig::new(
//!     "feed",
//!     ResourceSelector::table("posts"),
//!     |event| println!("feed changed: {:?}", event.new),
//! ))
//! .await?;
//!
//! println!("{:?}", sync.connection_status());
//! sync.destroy().await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::backend::{ChangeEvent, ClientFactory, ResourceSelector};
use crate::config::{ConfigLoader, SyncConfig};
use crate::connection::{ConnectionFactory, ConnectionStatus, FactoryStatsSnapshot};
use crate::error::{SyncError, SyncResult};
use crate::resilience::CircuitState;
use crate::subscription::{
    RegistryMode, RegistryStatsSnapshot, SubscriptionConfig, SubscriptionRegistry,
};

/// Snapshot returned by [`RealtimeSync::connection_status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatusReport {
    pub status: ConnectionStatus,
    pub failure_count: u32,
    pub circuit_state: CircuitState,
    pub mode: RegistryMode,
    pub active_topic_count: usize,
    pub polling_topic_count: usize,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Milliseconds until the open circuit admits a probe
    pub retry_after_ms: Option<u64>,
    pub connection_stats: FactoryStatsSnapshot,
    pub subscription_stats: RegistryStatsSnapshot,
}

/// The realtime synchronization layer
pub struct RealtimeSync {
    config: SyncConfig,
    factory: ConnectionFactory,
    registry: SubscriptionRegistry,
    initialized: AtomicBool,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for RealtimeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSync")
            .field("factory", &self.factory)
            .field("registry", &self.registry)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RealtimeSync {
    /// Validate `config` and build the layer; nothing runs until
    /// [`initialize`](Self::initialize)
    pub fn new(config: SyncConfig, client_factory: Arc<dyn ClientFactory>) -> SyncResult<Self> {
        config.validate()?;

        let factory = ConnectionFactory::new(config.clone(), client_factory);
        let registry = SubscriptionRegistry::new(factory.clone(), &config);

        Ok(Self {
            config,
            factory,
            registry,
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Build from layered configuration (defaults, file, environment)
    pub fn from_loader(
        loader: ConfigLoader,
        client_factory: Arc<dyn ClientFactory>,
    ) -> SyncResult<Self> {
        let config = loader.load()?;
        Self::new(config, client_factory)
    }

    /// Start health probing and the registry's event loop
    ///
    /// Calling it again has no effect. Must run inside a Tokio runtime.
    pub fn initialize(&self) -> SyncResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.factory.start_health_probe();
        self.registry.start();

        info!(
            health_check_interval_ms = self.config.health_check_interval_ms,
            polling_interval_ms = self.config.polling_interval_ms,
            reconnection_interval_ms = self.config.reconnection_interval_ms,
            "🚀 Realtime sync initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Register a topic; transport problems go to the topic's error handler
    ///
    /// Only fails after [`destroy`](Self::destroy).
    #[instrument(skip(self, subscription), fields(topic = %subscription.key))]
    pub async fn subscribe(&self, subscription: SubscriptionConfig) -> SyncResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        if !self.is_initialized() {
            warn!("subscribe called before initialize; initializing now");
            self.initialize()?;
        }
        self.registry.subscribe(subscription).await
    }

    /// Shorthand for subscribing with a change callback
    pub async fn subscribe_with<F>(
        &self,
        key: impl Into<String>,
        resource: ResourceSelector,
        on_change: F,
    ) -> SyncResult<()>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(SubscriptionConfig::new(key, resource, on_change))
            .await
    }

    pub async fn unsubscribe(&self, key: &str) {
        self.registry.unsubscribe(key).await;
    }

    /// Current connection and subscription state
    pub fn connection_status(&self) -> ConnectionStatusReport {
        let health = self.factory.health();
        let registry = self.registry.status();

        ConnectionStatusReport {
            status: health.status,
            failure_count: health.failure_count,
            circuit_state: self.factory.circuit_state(),
            mode: registry.mode,
            active_topic_count: registry.active_topic_count,
            polling_topic_count: registry.polling_topic_count,
            last_connected_at: health.last_connected_at,
            retry_after_ms: health
                .retry_after(Instant::now())
                .map(|delay| delay.as_millis() as u64),
            connection_stats: self.factory.stats(),
            subscription_stats: self.registry.stats(),
        }
    }

    /// Observe connection status changes
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.factory.status_watch()
    }

    /// Close every channel, cancel every timer and clear all state
    ///
    /// Idempotent. Later `subscribe` calls fail with `ShutDown`.
    #[instrument(skip(self))]
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.registry.destroy().await;
        self.factory.shutdown().await;

        info!("Realtime sync destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }
}
