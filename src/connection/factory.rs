//! # Connection Factory
//!
//! Hands out one shared backend client. Attempts are gated by the circuit
//! breaker, retried with exponential backoff, and deduplicated: concurrent
//! callers await the same in-flight attempt instead of starting their own.
//! A background task probes the cached client so decay is noticed even when
//! nobody is asking for a connection.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{ClientFactory, RealtimeClient};
use crate::config::SyncConfig;
use crate::connection::health::{ConnectionHealth, ConnectionStatus};
use crate::error::{SyncError, SyncResult};
use crate::resilience::{Admission, BackoffPolicy, CircuitBreaker, CircuitState};

type ConnectAttempt = Shared<BoxFuture<'static, SyncResult<Arc<dyn RealtimeClient>>>>;

/// Counters describing the factory's work so far
#[derive(Debug, Default)]
pub struct FactoryStats {
    pub connection_attempts: AtomicU64,
    pub connection_failures: AtomicU64,
    pub circuit_rejections: AtomicU64,
    pub health_probes: AtomicU64,
    pub health_probe_failures: AtomicU64,
}

/// Serializable view of [`FactoryStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactoryStatsSnapshot {
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub circuit_rejections: u64,
    pub health_probes: u64,
    pub health_probe_failures: u64,
}

impl FactoryStats {
    fn snapshot(&self) -> FactoryStatsSnapshot {
        FactoryStatsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            health_probes: self.health_probes.load(Ordering::Relaxed),
            health_probe_failures: self.health_probe_failures.load(Ordering::Relaxed),
        }
    }
}

/// Produces and guards the single shared backend client
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    factory_id: Uuid,
    config: SyncConfig,
    client_factory: Arc<dyn ClientFactory>,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
    health: RwLock<ConnectionHealth>,
    cached: RwLock<Option<Arc<dyn RealtimeClient>>>,
    in_flight: Mutex<Option<(u64, ConnectAttempt)>>,
    attempt_seq: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
    health_probe: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    stats: FactoryStats,
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("factory_id", &self.inner.factory_id)
            .field("health", &*self.inner.health.read())
            .field("has_cached_client", &self.inner.cached.read().is_some())
            .finish()
    }
}

impl ConnectionFactory {
    /// Create a factory; no connection is attempted until first use
    pub fn new(config: SyncConfig, client_factory: Arc<dyn ClientFactory>) -> Self {
        let factory_id = Uuid::new_v4();
        let breaker = CircuitBreaker::new(
            "realtime_connection",
            config.circuit_breaker_threshold,
            config.max_retry_delay(),
        );
        let backoff = BackoffPolicy::from_config(&config);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        info!(
            factory_id = %factory_id,
            max_retries = config.max_retries,
            probe_timeout_ms = config.probe_timeout_ms,
            "Creating ConnectionFactory"
        );

        Self {
            inner: Arc::new(FactoryInner {
                factory_id,
                config,
                client_factory,
                breaker,
                backoff,
                health: RwLock::new(ConnectionHealth::new()),
                cached: RwLock::new(None),
                in_flight: Mutex::new(None),
                attempt_seq: AtomicU64::new(0),
                status_tx,
                health_probe: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                stats: FactoryStats::default(),
            }),
        }
    }

    /// Return the shared client, connecting if necessary
    ///
    /// Fails fast with `ConnectionUnavailable` while the circuit is open and
    /// with `ShutDown` once [`shutdown`](Self::shutdown) has started.
    #[instrument(skip(self), fields(factory_id = %self.inner.factory_id))]
    pub async fn get_connection(&self) -> SyncResult<Arc<dyn RealtimeClient>> {
        let (seq, attempt) = {
            let mut in_flight = self.inner.in_flight.lock();

            if self.inner.is_shut_down() {
                return Err(SyncError::ShutDown);
            }

            if let Some(client) = self.inner.healthy_client() {
                return Ok(client);
            }

            match in_flight.as_ref() {
                Some((seq, attempt)) => {
                    debug!(attempt_seq = seq, "Joining in-flight connection attempt");
                    (*seq, attempt.clone())
                }
                None => {
                    let admission = {
                        let mut health = self.inner.health.write();
                        self.inner.breaker.admit(&mut health, Instant::now())
                    };
                    let admission = match admission {
                        Ok(admission) => admission,
                        Err(rejection) => {
                            self.inner
                                .stats
                                .circuit_rejections
                                .fetch_add(1, Ordering::Relaxed);
                            debug!(error = %rejection, "Connection attempt rejected by circuit breaker");
                            return Err(rejection);
                        }
                    };

                    // A new attempt invalidates whatever handle was cached before
                    *self.inner.cached.write() = None;

                    let seq = self.inner.attempt_seq.fetch_add(1, Ordering::Relaxed) + 1;
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move { inner.connect_with_retries(admission).await }
                        .boxed()
                        .shared();
                    *in_flight = Some((seq, attempt.clone()));
                    (seq, attempt)
                }
            }
        };

        let result = attempt.await;

        let mut in_flight = self.inner.in_flight.lock();
        if matches!(in_flight.as_ref(), Some((current, _)) if *current == seq) {
            *in_flight = None;
        }

        result
    }

    /// The cached client if the connection is currently healthy
    pub fn current_client(&self) -> Option<Arc<dyn RealtimeClient>> {
        self.inner.healthy_client()
    }

    /// Snapshot of the connection health
    pub fn health(&self) -> ConnectionHealth {
        self.inner.health.read().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.health.read().status
    }

    /// Circuit state derived from the current health
    pub fn circuit_state(&self) -> CircuitState {
        let health = self.inner.health.read();
        self.inner.breaker.state(&health, Instant::now())
    }

    /// Observe connection status changes
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn stats(&self) -> FactoryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Record how many topics are currently served by polling
    ///
    /// A lost connection with polling topics is reported as `Polling`;
    /// `Failed` is never downgraded.
    pub fn note_polling_topics(&self, polling_topics: usize) {
        let changed = {
            let mut health = self.inner.health.write();
            let next = match (health.status, polling_topics > 0) {
                (ConnectionStatus::Disconnected, true) => ConnectionStatus::Polling,
                (ConnectionStatus::Polling, false) => ConnectionStatus::Disconnected,
                _ => return,
            };
            health.status = next;
            next
        };
        self.inner.publish(changed);
    }

    /// Start the background health probe; calling it twice has no effect
    pub fn start_health_probe(&self) {
        let mut slot = self.inner.health_probe.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let period = self.inner.config.health_check_interval();
        let weak: Weak<FactoryInner> = Arc::downgrade(&self.inner);

        info!(
            factory_id = %self.inner.factory_id,
            interval_ms = period.as_millis() as u64,
            "Starting connection health probe"
        );

        *slot = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.run_health_probe().await;
            }
        }));
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    pub fn is_health_probe_running(&self) -> bool {
        self.inner
            .health_probe
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop probing, drop the cached client and reset health and breaker
    ///
    /// Terminal: attempts still in flight finish with `ShutDown` without
    /// caching their client, and later calls to `get_connection` fail.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);

        let probe = self.inner.health_probe.lock().take();
        if let Some(task) = probe {
            task.abort();
            let _ = task.await;
        }

        self.reset();
        info!(factory_id = %self.inner.factory_id, "ConnectionFactory shut down");
    }

    /// Forget the cached client and return the breaker to closed
    pub fn reset(&self) {
        self.inner.in_flight.lock().take();
        self.inner.cached.write().take();
        {
            let mut health = self.inner.health.write();
            self.inner.breaker.reset(&mut health);
        }
        self.inner.publish(ConnectionStatus::Disconnected);
    }
}

/// Holds a half-open probe slot until the admitted attempt reports an
/// outcome; an attempt dropped or abandoned before that frees the slot
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl<'a> ProbeSlot<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            held: admission == Admission::Probe,
        }
    }

    /// The outcome was recorded on the breaker, which released the slot
    fn settle(&mut self) {
        self.held = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.release_probe();
        }
    }
}

impl FactoryInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn healthy_client(&self) -> Option<Arc<dyn RealtimeClient>> {
        if self.health.read().status != ConnectionStatus::Connected {
            return None;
        }
        self.cached.read().clone()
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.health.write().status = status;
        self.publish(status);
    }

    async fn connect_with_retries(
        self: Arc<Self>,
        admission: Admission,
    ) -> SyncResult<Arc<dyn RealtimeClient>> {
        let max_attempts = match admission {
            Admission::Normal => self.config.max_retries.max(1),
            Admission::Probe => 1,
        };
        let mut probe_slot = ProbeSlot::new(&self.breaker, admission);
        let mut last_error: Option<SyncError> = None;

        for attempt in 1..=max_attempts {
            if self.is_shut_down() {
                return Err(SyncError::ShutDown);
            }
            self.set_status(ConnectionStatus::Connecting);
            self.stats.connection_attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = self.try_connect().await;
            if self.is_shut_down() {
                debug!(
                    factory_id = %self.factory_id,
                    attempt,
                    "Connection attempt abandoned after shutdown"
                );
                self.settle_abandoned();
                return Err(SyncError::ShutDown);
            }

            match outcome {
                Ok(client) => {
                    {
                        let mut health = self.health.write();
                        self.breaker.record_success(&mut health, admission);
                    }
                    probe_slot.settle();
                    *self.cached.write() = Some(Arc::clone(&client));
                    self.publish(ConnectionStatus::Connected);

                    info!(
                        factory_id = %self.factory_id,
                        attempt,
                        "✅ Realtime connection established"
                    );
                    return Ok(client);
                }
                Err(error) => {
                    self.stats.connection_failures.fetch_add(1, Ordering::Relaxed);
                    let (opened, failure_count) = {
                        let mut health = self.health.write();
                        let opened =
                            self.breaker
                                .record_failure(&mut health, admission, Instant::now());
                        (opened, health.failure_count)
                    };
                    probe_slot.settle();

                    warn!(
                        factory_id = %self.factory_id,
                        attempt,
                        max_attempts,
                        failure_count,
                        error = %error,
                        "Connection attempt failed"
                    );
                    last_error = Some(error);

                    if opened {
                        break;
                    }

                    if attempt < max_attempts {
                        let delay = self.backoff.next_delay(attempt);
                        debug!(
                            factory_id = %self.factory_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Backing off before next connection attempt"
                        );
                        time::sleep(delay).await;
                    }
                }
            }
        }

        let retry_after = {
            let mut health = self.health.write();
            let now = Instant::now();
            health.status = ConnectionStatus::Failed;
            health.next_retry_at = Some(now + self.backoff.max_delay());
            health.retry_after(now)
        };
        self.publish(ConnectionStatus::Failed);

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no connection attempt was made".to_string());
        error!(
            factory_id = %self.factory_id,
            reason = %reason,
            "🔴 Realtime connection unavailable"
        );

        Err(SyncError::connection_unavailable(reason, retry_after))
    }

    /// Leave no `Connecting` status behind an attempt cut short by shutdown
    fn settle_abandoned(&self) {
        {
            let mut health = self.health.write();
            if health.status != ConnectionStatus::Connecting {
                return;
            }
            health.status = ConnectionStatus::Disconnected;
        }
        self.publish(ConnectionStatus::Disconnected);
    }

    async fn try_connect(&self) -> SyncResult<Arc<dyn RealtimeClient>> {
        let client = self
            .client_factory
            .create_client(&self.config.endpoint)
            .await?;

        match time::timeout(self.config.probe_timeout(), client.probe()).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(SyncError::ProbeTimeout {
                timeout_ms: self.config.probe_timeout_ms,
            }),
        }
    }

    async fn run_health_probe(&self) {
        let Some(client) = self.healthy_client() else {
            debug!(factory_id = %self.factory_id, "No healthy connection to probe");
            return;
        };

        self.stats.health_probes.fetch_add(1, Ordering::Relaxed);
        let outcome = match time::timeout(self.config.probe_timeout(), client.probe()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ProbeTimeout {
                timeout_ms: self.config.probe_timeout_ms,
            }),
        };

        match outcome {
            Ok(()) => debug!(factory_id = %self.factory_id, "Health probe succeeded"),
            Err(error) => {
                self.stats
                    .health_probe_failures
                    .fetch_add(1, Ordering::Relaxed);
                {
                    let mut health = self.health.write();
                    if health.status != ConnectionStatus::Connected {
                        return;
                    }
                    self.breaker.record_decay(&mut health);
                    health.status = ConnectionStatus::Disconnected;
                }
                self.cached.write().take();
                self.publish(ConnectionStatus::Disconnected);

                warn!(
                    factory_id = %self.factory_id,
                    error = %error,
                    "Health probe failed; cached connection invalidated"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChannelSink, RealtimeChannel, ResourceSelector, Row};
    use crate::config::BackendEndpoint;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct ScriptedClient {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RealtimeClient for ScriptedClient {
        async fn probe(&self) -> SyncResult<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SyncError::probe("unreachable"))
            }
        }

        async fn open_channel(
            &self,
            _topic: &str,
            _resource: &ResourceSelector,
            _sink: ChannelSink,
        ) -> SyncResult<Box<dyn RealtimeChannel>> {
            Err(SyncError::probe("channels unsupported"))
        }

        async fn query(&self, _resource: &ResourceSelector) -> SyncResult<Vec<Row>> {
            Ok(Vec::new())
        }
    }

    struct ScriptedFactory {
        healthy: Arc<AtomicBool>,
        created: AtomicU64,
    }

    #[async_trait]
    impl ClientFactory for ScriptedFactory {
        async fn create_client(
            &self,
            _endpoint: &BackendEndpoint,
        ) -> SyncResult<Arc<dyn RealtimeClient>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedClient {
                healthy: Arc::clone(&self.healthy),
            }))
        }
    }

    fn factory(healthy: bool) -> (ConnectionFactory, Arc<ScriptedFactory>) {
        let scripted = Arc::new(ScriptedFactory {
            healthy: Arc::new(AtomicBool::new(healthy)),
            created: AtomicU64::new(0),
        });
        let config = SyncConfig::default().with_circuit_breaker_threshold(3);
        (
            ConnectionFactory::new(config, scripted.clone() as Arc<dyn ClientFactory>),
            scripted,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_is_cached() {
        let (factory, scripted) = factory(true);

        factory.get_connection().await.unwrap();
        factory.get_connection().await.unwrap();

        assert_eq!(scripted.created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.status(), ConnectionStatus::Connected);
        assert_eq!(factory.health().failure_count, 0);
        assert_eq!(factory.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_reached_mid_sequence_opens_circuit() {
        let (factory, scripted) = factory(false);

        let err = factory.get_connection().await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionUnavailable { .. }));
        assert!(!err.is_circuit_open());
        assert_eq!(scripted.created.load(Ordering::SeqCst), 3);
        assert_eq!(factory.status(), ConnectionStatus::Failed);
        assert_eq!(factory.circuit_state(), CircuitState::Open);

        let rejected = factory.get_connection().await.unwrap_err();
        assert!(rejected.is_circuit_open());
        assert_eq!(scripted.created.load(Ordering::SeqCst), 3);
        assert_eq!(factory.stats().circuit_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_probe_failure_invalidates_cache() {
        let (factory, scripted) = factory(true);
        let mut status = factory.status_watch();

        factory.get_connection().await.unwrap();
        factory.start_health_probe();
        assert!(factory.is_health_probe_running());

        scripted.healthy.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_secs(31)).await;

        assert_eq!(factory.status(), ConnectionStatus::Disconnected);
        assert!(factory.current_client().is_none());
        assert_eq!(factory.health().failure_count, 1);
        assert_eq!(factory.circuit_state(), CircuitState::Closed);
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);

        factory.shutdown().await;
        assert!(!factory.is_health_probe_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_status_tracks_topics() {
        let (factory, _) = factory(true);
        factory.note_polling_topics(2);
        assert_eq!(factory.status(), ConnectionStatus::Polling);
        factory.note_polling_topics(0);
        assert_eq!(factory.status(), ConnectionStatus::Disconnected);

        factory.get_connection().await.unwrap();
        factory.note_polling_topics(1);
        assert_eq!(factory.status(), ConnectionStatus::Connected);
    }
}
