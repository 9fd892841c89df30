//! # Subscription Registry
//!
//! Owns the desired subscriptions and the transport currently serving each
//! one. Every topic starts on push; a failed open, a lost channel or a
//! degraded connection moves it to polling and schedules reconnection. A
//! successful reconnection moves polling topics back to push.
//!
//! Each transport switch is tagged with a fresh generation. Work that
//! finishes after its generation has been superseded (by `unsubscribe`, a
//! second `subscribe` or another switch) closes what it opened instead of
//! installing it, so a topic never ends up with two transports.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::handler::SubscriptionConfig;
use crate::backend::TransportKind;
use crate::config::SyncConfig;
use crate::connection::{ConnectionFactory, ConnectionStatus};
use crate::error::{SyncError, SyncResult};
use crate::reconnection::{ReconnectionScheduler, RecoveryTarget};
use crate::transport::{
    PollHandle, PollTransport, PushHandle, PushTransport, RetiredFlag, TopicContext,
    TransportFailure, TransportStatsSnapshot, TransportStrategy,
};

/// Aggregate mode of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// No subscriptions
    Idle,
    /// Every topic is on push
    Live,
    /// At least one topic is polling
    Degraded,
}

/// Topic counts reported by [`SubscriptionRegistry::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub mode: RegistryMode,
    pub active_topic_count: usize,
    pub polling_topic_count: usize,
}

#[derive(Debug, Default)]
struct RegistryStats {
    failovers: AtomicU64,
    recoveries: AtomicU64,
    recovery_attempts: AtomicU64,
    stale_failures: AtomicU64,
}

/// Serializable view of the registry's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStatsSnapshot {
    pub failovers: u64,
    pub recoveries: u64,
    pub recovery_attempts: u64,
    pub stale_failures: u64,
    pub push: TransportStatsSnapshot,
    pub poll: TransportStatsSnapshot,
}

enum ActiveTransport {
    Push(PushHandle),
    Poll(PollHandle),
}

impl ActiveTransport {
    fn kind(&self) -> TransportKind {
        match self {
            ActiveTransport::Push(_) => TransportKind::Push,
            ActiveTransport::Poll(_) => TransportKind::Poll,
        }
    }
}

struct TopicEntry {
    subscription: Arc<SubscriptionConfig>,
    generation: u64,
    /// Shared with the context of the current generation
    retired: RetiredFlag,
    transport: Option<ActiveTransport>,
}

/// Owns desired subscriptions and drives failover and recovery
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    registry_id: Uuid,
    self_ref: Weak<RegistryInner>,
    factory: ConnectionFactory,
    push: PushTransport,
    poll: PollTransport,
    topics: Mutex<HashMap<String, TopicEntry>>,
    generation: AtomicU64,
    failures_tx: mpsc::UnboundedSender<TransportFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportFailure>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    scheduler: ReconnectionScheduler,
    shut_down: AtomicBool,
    stats: RegistryStats,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("registry_id", &self.inner.registry_id)
            .field("status", &self.status())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new(factory: ConnectionFactory, config: &SyncConfig) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let registry_id = Uuid::new_v4();

        debug!(registry_id = %registry_id, "Creating SubscriptionRegistry");

        let inner = Arc::new_cyclic(|self_ref| RegistryInner {
            registry_id,
            self_ref: self_ref.clone(),
            push: PushTransport::new(factory.clone(), config.subscribe_timeout()),
            poll: PollTransport::new(factory.clone(), config.polling_interval()),
            factory,
            topics: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            event_loop: Mutex::new(None),
            scheduler: ReconnectionScheduler::new(config.reconnection_interval()),
            shut_down: AtomicBool::new(false),
            stats: RegistryStats::default(),
        });

        Self { inner }
    }

    /// Start reacting to transport failures and connection degradation
    ///
    /// Idempotent; `subscribe` calls it on demand.
    pub fn start(&self) {
        let mut slot = self.inner.event_loop.lock();
        if slot.is_some() {
            return;
        }
        let Some(mut failures) = self.inner.failures_rx.lock().take() else {
            return;
        };

        let weak = self.inner.self_ref.clone();
        let mut status = self.inner.factory.status_watch();
        let _ = status.borrow_and_update();

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    failure = failures.recv() => {
                        let Some(failure) = failure else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        inner.handle_failure(failure).await;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *status.borrow_and_update();
                        if !current.is_degraded() {
                            continue;
                        }
                        let Some(inner) = weak.upgrade() else { break };
                        inner.demote_push_topics(current).await;
                    }
                }
            }
            debug!("Registry event loop exited");
        }));
    }

    /// Register `subscription` and start delivering its changes
    ///
    /// Tries push first and falls back to polling; a transport problem is
    /// reported to the topic's error handler, never returned. Subscribing an
    /// existing key replaces the previous subscription.
    #[instrument(skip(self, subscription), fields(topic = %subscription.key))]
    pub async fn subscribe(&self, subscription: SubscriptionConfig) -> SyncResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        self.start();
        self.inner.subscribe(Arc::new(subscription)).await;
        Ok(())
    }

    /// Stop delivering `key` and forget it; unknown keys are ignored
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, key: &str) {
        let removed = self.inner.topics.lock().remove(key);
        let Some(entry) = removed else {
            debug!(topic = key, "Unsubscribe for unknown topic ignored");
            return;
        };
        entry.retired.retire();

        if let Some(transport) = entry.transport {
            self.inner.close_transport(transport).await;
        }
        self.inner.sync_polling_status();
        info!(topic = key, "Unsubscribed");
    }

    pub fn status(&self) -> RegistryStatus {
        self.inner.status()
    }

    /// Which transport currently serves `key`, if any
    pub fn topic_transport(&self, key: &str) -> Option<TransportKind> {
        self.inner
            .topics
            .lock()
            .get(key)
            .and_then(|entry| entry.transport.as_ref().map(ActiveTransport::kind))
    }

    /// Subscribed topic keys, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.topics.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Try to move every polling topic back to push now
    ///
    /// Returns the number of topics still polling afterwards.
    pub async fn recover_polling_topics(&self) -> usize {
        self.inner.recover_polling_topics().await
    }

    pub fn is_reconnection_scheduled(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    pub fn reconnection_ticks(&self) -> u64 {
        self.inner.scheduler.ticks()
    }

    /// Polling timers currently running
    pub fn active_poll_timers(&self) -> usize {
        self.inner.poll.active_timers()
    }

    /// Push channels currently open
    pub fn open_push_channels(&self) -> usize {
        self.inner.push.stats().live.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        let stats = &self.inner.stats;
        RegistryStatsSnapshot {
            failovers: stats.failovers.load(Ordering::Relaxed),
            recoveries: stats.recoveries.load(Ordering::Relaxed),
            recovery_attempts: stats.recovery_attempts.load(Ordering::Relaxed),
            stale_failures: stats.stale_failures.load(Ordering::Relaxed),
            push: self.inner.push.stats().snapshot(),
            poll: self.inner.poll.stats().snapshot(),
        }
    }

    /// Close every transport, cancel every timer and forget every topic
    pub async fn destroy(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let event_loop = self.inner.event_loop.lock().take();
        if let Some(task) = event_loop {
            task.abort();
            let _ = task.await;
        }
        self.inner.scheduler.stop().await;

        let entries: Vec<TopicEntry> = {
            let mut topics = self.inner.topics.lock();
            topics.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in &entries {
            entry.retired.retire();
        }
        for entry in entries {
            if let Some(transport) = entry.transport {
                self.inner.close_transport(transport).await;
            }
        }

        info!(
            registry_id = %self.inner.registry_id,
            topics_closed = count,
            "SubscriptionRegistry destroyed"
        );
    }
}

impl RegistryInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn context(&self, subscription: &Arc<SubscriptionConfig>, generation: u64) -> TopicContext {
        TopicContext {
            subscription: Arc::clone(subscription),
            generation,
            failures: self.failures_tx.clone(),
            retired: RetiredFlag::new(),
        }
    }

    fn status(&self) -> RegistryStatus {
        let topics = self.topics.lock();
        let mut active = 0;
        let mut polling = 0;
        for entry in topics.values() {
            match entry.transport.as_ref().map(ActiveTransport::kind) {
                Some(TransportKind::Push) => active += 1,
                Some(TransportKind::Poll) => {
                    active += 1;
                    polling += 1;
                }
                None => {}
            }
        }

        let mode = if topics.is_empty() {
            RegistryMode::Idle
        } else if polling > 0 {
            RegistryMode::Degraded
        } else {
            RegistryMode::Live
        };

        RegistryStatus {
            mode,
            active_topic_count: active,
            polling_topic_count: polling,
        }
    }

    fn polling_count(&self) -> usize {
        self.topics
            .lock()
            .values()
            .filter(|entry| matches!(entry.transport, Some(ActiveTransport::Poll(_))))
            .count()
    }

    fn sync_polling_status(&self) {
        self.factory.note_polling_topics(self.polling_count());
    }

    fn ensure_reconnection(&self) {
        let target: Weak<dyn RecoveryTarget> = self.self_ref.clone();
        self.scheduler.ensure_scheduled(target);
    }

    async fn close_transport(&self, transport: ActiveTransport) {
        match transport {
            ActiveTransport::Push(handle) => self.push.close(handle).await,
            ActiveTransport::Poll(handle) => self.poll.close(handle).await,
        }
    }

    /// Install `transport` if `key` is still waiting for `generation`;
    /// otherwise hand it back so the caller can close it
    fn install(
        &self,
        key: &str,
        generation: u64,
        transport: ActiveTransport,
    ) -> Option<ActiveTransport> {
        if self.shut_down.load(Ordering::Acquire) {
            return Some(transport);
        }
        let mut topics = self.topics.lock();
        match topics.get_mut(key) {
            Some(entry) if entry.generation == generation && entry.transport.is_none() => {
                let mut transport = transport;
                if let ActiveTransport::Push(handle) = &mut transport {
                    handle.activate();
                }
                entry.transport = Some(transport);
                None
            }
            _ => Some(transport),
        }
    }

    async fn subscribe(&self, subscription: Arc<SubscriptionConfig>) {
        let key = subscription.key.clone();
        let generation = self.next_generation();
        let context = self.context(&subscription, generation);

        let replaced = {
            let mut topics = self.topics.lock();
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }
            topics
                .insert(
                    key.clone(),
                    TopicEntry {
                        subscription: Arc::clone(&subscription),
                        generation,
                        retired: context.retired.clone(),
                        transport: None,
                    },
                )
                .and_then(|previous| {
                    previous.retired.retire();
                    previous.transport
                })
        };
        if let Some(previous) = replaced {
            debug!(topic = %key, "Replacing existing subscription");
            self.close_transport(previous).await;
        }

        match self.push.open(&context).await {
            Ok(handle) => {
                match self.install(&key, generation, ActiveTransport::Push(handle)) {
                    None => info!(topic = %key, resource = %subscription.resource, "✅ Subscribed via push"),
                    Some(stale) => {
                        debug!(topic = %key, "Subscription superseded while opening push");
                        self.close_transport(stale).await;
                    }
                }
            }
            Err(_) if context.is_retired() => {
                debug!(topic = %key, "Subscription retired while opening push");
            }
            Err(error) => {
                warn!(topic = %key, error = %error, "Push subscription failed; falling back to polling");
                subscription.handler.on_error(&error);
                self.fall_back_to_poll(&context).await;
            }
        }

        self.sync_polling_status();
    }

    /// Open a polling transport for a topic whose entry waits on
    /// `context.generation`
    async fn fall_back_to_poll(&self, context: &TopicContext) {
        let key = context.key();
        if context.is_retired() {
            debug!(topic = %key, "Subscription retired before polling started");
            return;
        }
        let handle = match self.poll.open(context).await {
            Ok(handle) => handle,
            Err(_) if context.is_retired() => return,
            Err(error) => {
                warn!(topic = %key, error = %error, "Polling fallback could not start");
                context.subscription.handler.on_error(&error);
                return;
            }
        };

        match self.install(key, context.generation, ActiveTransport::Poll(handle)) {
            None => {
                self.stats.failovers.fetch_add(1, Ordering::Relaxed);
                self.sync_polling_status();
                self.ensure_reconnection();
            }
            Some(stale) => {
                debug!(topic = %key, "Subscription superseded while starting poll");
                self.close_transport(stale).await;
            }
        }
    }

    /// Take the push transport of `key` if it is the one tagged `generation`
    /// and start a new generation with no transport
    fn take_push(&self, key: &str, generation: Option<u64>) -> Option<(PushHandle, TopicContext)> {
        let mut topics = self.topics.lock();
        let entry = topics.get_mut(key)?;
        if generation.is_some_and(|expected| expected != entry.generation) {
            return None;
        }
        if !matches!(entry.transport, Some(ActiveTransport::Push(_))) {
            return None;
        }

        let Some(ActiveTransport::Push(handle)) = entry.transport.take() else {
            return None;
        };
        entry.retired.retire();
        entry.generation = self.next_generation();
        let context = self.context(&entry.subscription, entry.generation);
        entry.retired = context.retired.clone();
        Some((handle, context))
    }

    /// Replace a topic's push transport with polling
    async fn demote(&self, handle: PushHandle, context: TopicContext, error: SyncError) {
        self.push.close(handle).await;
        if context.is_retired() {
            return;
        }
        context.subscription.handler.on_error(&error);
        self.fall_back_to_poll(&context).await;
    }

    async fn handle_failure(&self, failure: TransportFailure) {
        if failure.kind != TransportKind::Push {
            return;
        }

        let Some((handle, context)) = self.take_push(&failure.key, Some(failure.generation)) else {
            self.stats.stale_failures.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %failure.key, generation = failure.generation, "Ignoring stale transport failure");
            return;
        };

        warn!(topic = %failure.key, error = %failure.error, "Push transport failed; falling back to polling");
        self.demote(handle, context, failure.error).await;
    }

    /// Move every push topic to polling after the connection degraded
    async fn demote_push_topics(&self, status: ConnectionStatus) {
        let keys: Vec<String> = {
            let topics = self.topics.lock();
            topics
                .iter()
                .filter(|(_, entry)| matches!(entry.transport, Some(ActiveTransport::Push(_))))
                .map(|(key, _)| key.clone())
                .collect()
        };
        if keys.is_empty() {
            return;
        }

        warn!(
            status = %status,
            topics = keys.len(),
            "Connection degraded; moving push topics to polling"
        );

        for key in keys {
            if let Some((handle, context)) = self.take_push(&key, None) {
                let error = SyncError::channel_closed(&key, format!("connection {status}"));
                self.demote(handle, context, error).await;
            }
        }
    }

    /// Swap one polling topic to push; returns whether it now uses push
    async fn swap_poll_for_push(
        &self,
        key: &str,
        subscription: Arc<SubscriptionConfig>,
        poll_generation: u64,
    ) -> bool {
        let push_generation = self.next_generation();
        let context = self.context(&subscription, push_generation);

        let mut handle = match self.push.open(&context).await {
            Ok(handle) => handle,
            Err(error) => {
                debug!(topic = %key, error = %error, "Push re-open failed; topic stays on polling");
                return false;
            }
        };

        let poll = {
            let mut topics = self.topics.lock();
            match topics.get_mut(key) {
                Some(entry)
                    if entry.generation == poll_generation
                        && matches!(entry.transport, Some(ActiveTransport::Poll(_))) =>
                {
                    entry.retired.retire();
                    entry.generation = push_generation;
                    entry.retired = context.retired.clone();
                    entry.transport.take()
                }
                _ => None,
            }
        };
        let Some(poll) = poll else {
            debug!(topic = %key, "Topic changed during recovery; discarding push channel");
            self.push.close(handle).await;
            return false;
        };

        // Old transport fully closed before the new one delivers
        self.close_transport(poll).await;

        let leftover = {
            let mut topics = self.topics.lock();
            match topics.get_mut(key) {
                _ if self.shut_down.load(Ordering::Acquire) => Some(handle),
                Some(entry) if entry.generation == push_generation && entry.transport.is_none() => {
                    handle.activate();
                    entry.transport = Some(ActiveTransport::Push(handle));
                    None
                }
                _ => Some(handle),
            }
        };

        match leftover {
            None => true,
            Some(handle) => {
                self.push.close(handle).await;
                false
            }
        }
    }

    async fn recover_polling_topics(&self) -> usize {
        let candidates: Vec<(String, Arc<SubscriptionConfig>, u64)> = {
            let topics = self.topics.lock();
            topics
                .iter()
                .filter(|(_, entry)| matches!(entry.transport, Some(ActiveTransport::Poll(_))))
                .map(|(key, entry)| (key.clone(), Arc::clone(&entry.subscription), entry.generation))
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }

        self.stats.recovery_attempts.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = self.factory.get_connection().await {
            debug!(error = %error, polling = candidates.len(), "Reconnection attempt failed");
            return self.polling_count();
        }

        let mut recovered = 0;
        for (key, subscription, generation) in candidates {
            if self.swap_poll_for_push(&key, subscription, generation).await {
                recovered += 1;
                self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                info!(topic = %key, "✅ Topic recovered to push");
            }
        }

        let remaining = self.polling_count();
        self.sync_polling_status();
        info!(recovered, remaining, "Reconnection attempt finished");
        remaining
    }
}

#[async_trait]
impl RecoveryTarget for RegistryInner {
    async fn attempt_recovery(&self) -> usize {
        self.recover_polling_topics().await
    }

    fn polling_topic_count(&self) -> usize {
        self.polling_count()
    }
}
