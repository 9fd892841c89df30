//! Poll transport: re-query a resource on an interval and synthesize an
//! event whenever the result differs from the previous snapshot.
//!
//! Change detection compares whole result lists by value. It reports that
//! something changed, not which rows did.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{TopicContext, TransportStats, TransportStrategy};
use crate::backend::{ChangeEvent, Row, TransportKind};
use crate::connection::ConnectionFactory;
use crate::error::{SyncError, SyncResult};

/// Last result observed for one topic
#[derive(Debug, Default, Clone)]
pub struct SnapshotCache {
    rows: Option<Vec<Row>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `rows` and report whether they differ from the previous result
    ///
    /// The first observation always counts as a change.
    pub fn observe(&mut self, rows: Vec<Row>) -> bool {
        if self.rows.as_ref() == Some(&rows) {
            return false;
        }
        self.rows = Some(rows);
        true
    }

    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_deref()
    }

    pub fn clear(&mut self) {
        self.rows = None;
    }
}

/// Runs one polling timer per topic
pub struct PollTransport {
    factory: ConnectionFactory,
    interval: Duration,
    stats: Arc<TransportStats>,
}

/// A running polling timer for one topic
///
/// The timer task owns the topic's [`SnapshotCache`], so closing the handle
/// discards the cache with it.
pub struct PollHandle {
    poller_id: Uuid,
    key: String,
    task: Option<JoinHandle<()>>,
    stats: Arc<TransportStats>,
}

impl PollTransport {
    pub fn new(factory: ConnectionFactory, interval: Duration) -> Self {
        Self {
            factory,
            interval,
            stats: Arc::new(TransportStats::default()),
        }
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of polling timers currently running
    pub fn active_timers(&self) -> usize {
        self.stats.live.load(Ordering::Relaxed)
    }
}

/// Run one poll: query, compare, deliver on change
async fn poll_once(
    factory: &ConnectionFactory,
    topic: &TopicContext,
    cache: &mut SnapshotCache,
    stats: &TransportStats,
) {
    stats.poll_ticks.fetch_add(1, Ordering::Relaxed);
    let subscription = &topic.subscription;

    let rows = match factory.get_connection().await {
        Ok(client) => client.query(&subscription.resource).await,
        Err(error) => Err(error),
    };

    // Unsubscribed or torn down while the query was running
    if topic.is_retired() {
        debug!(topic = %topic.key(), "Discarding poll result for retired subscription");
        return;
    }

    match rows {
        Ok(rows) => {
            if cache.observe(rows) {
                let latest = cache.rows().unwrap_or(&[]);
                debug!(topic = %topic.key(), rows = latest.len(), "Poll detected change");
                stats.changes_delivered.fetch_add(1, Ordering::Relaxed);
                subscription
                    .handler
                    .on_change(ChangeEvent::polled(topic.key(), latest));
            }
        }
        Err(error) => {
            stats.poll_errors.fetch_add(1, Ordering::Relaxed);
            let error = SyncError::poll_query(topic.key(), error.to_string());
            debug!(topic = %topic.key(), error = %error, "Poll query failed");
            subscription.handler.on_error(&error);
        }
    }
}

#[async_trait]
impl TransportStrategy for PollTransport {
    type Handle = PollHandle;

    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    /// Poll once immediately, then keep polling on the interval
    ///
    /// Opening never fails: a failed first query is reported to the topic's
    /// error handler and the timer starts anyway.
    async fn open(&self, topic: &TopicContext) -> SyncResult<PollHandle> {
        let poller_id = Uuid::new_v4();
        let mut cache = SnapshotCache::new();

        poll_once(&self.factory, topic, &mut cache, &self.stats).await;

        let factory = self.factory.clone();
        let context = topic.clone();
        let stats = Arc::clone(&self.stats);
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                poll_once(&factory, &context, &mut cache, &stats).await;
            }
        });

        self.stats.live.fetch_add(1, Ordering::Relaxed);
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        info!(
            topic = %topic.key(),
            poller_id = %poller_id,
            interval_ms = period.as_millis() as u64,
            "🔄 Polling fallback started"
        );

        Ok(PollHandle {
            poller_id,
            key: topic.key().to_string(),
            task: Some(task),
            stats: Arc::clone(&self.stats),
        })
    }

    async fn close(&self, mut handle: PollHandle) {
        if let Some(task) = handle.release() {
            task.abort();
            let _ = task.await;
            debug!(topic = %handle.key, poller_id = %handle.poller_id, "Polling timer cancelled");
        }
    }
}

impl PollHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn poller_id(&self) -> Uuid {
        self.poller_id
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn release(&mut self) -> Option<JoinHandle<()>> {
        let task = self.task.take()?;
        self.stats.live.fetch_sub(1, Ordering::Relaxed);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Some(task) = self.release() {
            warn!(topic = %self.key, "Poll handle dropped without close");
            task.abort();
        }
    }
}
