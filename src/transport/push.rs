//! Push transport: a persistent backend channel per topic.
//!
//! Opening waits for the channel to confirm its subscription. Events that
//! arrive afterwards are buffered until the registry activates the handle,
//! so a topic that is switching from polling never delivers from both
//! transports at once.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::{TopicContext, TransportStats, TransportStrategy};
use crate::backend::{
    ChangeEvent, ChannelEvent, ChannelStatus, RealtimeChannel, ResourceSelector, TransportKind,
};
use crate::connection::ConnectionFactory;
use crate::error::{SyncError, SyncResult};

/// Opens backend channels through the shared connection
pub struct PushTransport {
    factory: ConnectionFactory,
    subscribe_timeout: Duration,
    stats: Arc<TransportStats>,
}

/// Events received before the handle was activated
struct PendingDelivery {
    early: Vec<ChangeEvent>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// An open channel for one topic
pub struct PushHandle {
    context: TopicContext,
    channel: Option<Box<dyn RealtimeChannel>>,
    pending: Option<PendingDelivery>,
    forwarder: Option<JoinHandle<()>>,
    stats: Arc<TransportStats>,
}

impl PushTransport {
    pub fn new(factory: ConnectionFactory, subscribe_timeout: Duration) -> Self {
        Self {
            factory,
            subscribe_timeout,
            stats: Arc::new(TransportStats::default()),
        }
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    async fn open_channel(&self, topic: &TopicContext) -> SyncResult<PushHandle> {
        let key = topic.key();
        let resource = &topic.subscription.resource;

        let client = self
            .factory
            .get_connection()
            .await
            .map_err(|e| SyncError::subscription_open(key, e.to_string()))?;

        let (sink, mut events) = mpsc::unbounded_channel();
        let channel = client
            .open_channel(&ResourceSelector::channel_topic(key), resource, sink)
            .await
            .map_err(|e| SyncError::subscription_open(key, e.to_string()))?;

        let confirmation = time::timeout(self.subscribe_timeout, async {
            let mut early = Vec::new();
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Status(ChannelStatus::Subscribed) => return Ok(early),
                    ChannelEvent::Status(status) => return Err(status.to_string()),
                    ChannelEvent::Change(change) => early.push(change),
                }
            }
            Err("channel closed before confirming subscription".to_string())
        })
        .await;

        let failure = match confirmation {
            Ok(Ok(early)) => {
                self.stats.live.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %key, channel = channel.topic(), "Push channel subscribed");
                return Ok(PushHandle {
                    context: topic.clone(),
                    channel: Some(channel),
                    pending: Some(PendingDelivery { early, events }),
                    forwarder: None,
                    stats: Arc::clone(&self.stats),
                });
            }
            Ok(Err(status)) => status,
            Err(_) => format!(
                "subscription not confirmed within {}ms",
                self.subscribe_timeout.as_millis()
            ),
        };

        if let Err(error) = channel.unsubscribe().await {
            debug!(topic = %key, error = %error, "Unsubscribe after failed open also failed");
        }
        Err(SyncError::subscription_open(key, failure))
    }
}

#[async_trait]
impl TransportStrategy for PushTransport {
    type Handle = PushHandle;

    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    async fn open(&self, topic: &TopicContext) -> SyncResult<PushHandle> {
        match self.open_channel(topic).await {
            Ok(handle) => {
                self.stats.opened.fetch_add(1, Ordering::Relaxed);
                Ok(handle)
            }
            Err(error) => {
                self.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    async fn close(&self, mut handle: PushHandle) {
        if let Some(forwarder) = handle.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
        handle.pending = None;

        if let Some(channel) = handle.channel.take() {
            self.stats.live.fetch_sub(1, Ordering::Relaxed);
            self.stats.closed.fetch_add(1, Ordering::Relaxed);
            if let Err(error) = channel.unsubscribe().await {
                warn!(topic = %handle.context.key(), error = %error, "Failed to unsubscribe push channel");
            }
        }
    }
}

impl PushHandle {
    pub fn key(&self) -> &str {
        self.context.key()
    }

    pub fn is_active(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Start delivering events to the topic handler
    ///
    /// Buffered events are delivered first. A channel status other than
    /// `Subscribed`, or the backend dropping the channel, is reported as a
    /// transport failure and ends delivery.
    pub fn activate(&mut self) {
        let Some(PendingDelivery { early, mut events }) = self.pending.take() else {
            return;
        };

        let context = self.context.clone();
        let stats = Arc::clone(&self.stats);

        self.forwarder = Some(tokio::spawn(async move {
            let subscription = Arc::clone(&context.subscription);
            let deliver = |event: ChangeEvent| {
                if context.is_retired() {
                    return;
                }
                if subscription.resource.events.matches(event.kind) {
                    stats.changes_delivered.fetch_add(1, Ordering::Relaxed);
                    subscription.handler.on_change(event);
                }
            };

            for event in early {
                deliver(event);
            }

            let reason = loop {
                match events.recv().await {
                    Some(ChannelEvent::Change(event)) => deliver(event),
                    Some(ChannelEvent::Status(ChannelStatus::Subscribed)) => {
                        debug!(topic = %context.key(), "Push channel re-confirmed subscription");
                    }
                    Some(ChannelEvent::Status(status)) => break status.to_string(),
                    None => break "channel dropped by backend".to_string(),
                }
            };

            info!(topic = %context.key(), reason = %reason, "Push channel lost");
            context.report_failure(
                TransportKind::Push,
                SyncError::channel_closed(context.key(), reason),
            );
        }));
    }
}

impl Drop for PushHandle {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if let Some(channel) = self.channel.take() {
            self.stats.live.fetch_sub(1, Ordering::Relaxed);
            self.stats.closed.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %self.context.key(), "Push handle dropped without close");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = channel.unsubscribe().await;
                });
            }
        }
    }
}
