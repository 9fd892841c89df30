//! In-memory realtime backend that counts every resource it hands out.

use async_trait::async_trait;
use parking_lot::Mutex;
use realtime_sync::backend::{
    ChangeEvent, ChangeKind, ChannelEvent, ChannelSink, ChannelStatus, ClientFactory,
    RealtimeChannel, RealtimeClient, ResourceSelector, Row,
};
use realtime_sync::{BackendEndpoint, SyncError, SyncResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How `open_channel` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushBehavior {
    /// Confirm the subscription
    Subscribe,
    /// Report CHANNEL_ERROR right after opening
    Reject,
    /// Never confirm (the subscribe timeout fires)
    Silent,
}

#[derive(Debug)]
pub struct FakeBackend {
    pub creates: AtomicUsize,
    pub probes: AtomicUsize,
    pub channel_opens: AtomicUsize,
    pub channel_closes: AtomicUsize,
    pub queries: AtomicUsize,
    create_failing: AtomicBool,
    probe_failing: AtomicBool,
    query_failing: AtomicBool,
    create_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    open_delay: Mutex<Duration>,
    push: Mutex<PushBehavior>,
    query_script: Mutex<VecDeque<Vec<Row>>>,
    last_rows: Mutex<Vec<Row>>,
    sinks: Mutex<HashMap<String, ChannelSink>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            creates: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            channel_opens: AtomicUsize::new(0),
            channel_closes: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            create_failing: AtomicBool::new(false),
            probe_failing: AtomicBool::new(false),
            query_failing: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            probe_delay: Mutex::new(Duration::ZERO),
            open_delay: Mutex::new(Duration::ZERO),
            push: Mutex::new(PushBehavior::Subscribe),
            query_script: Mutex::new(VecDeque::new()),
            last_rows: Mutex::new(Vec::new()),
            sinks: Mutex::new(HashMap::new()),
        })
    }

    /// A backend nothing can connect to
    pub fn unreachable() -> Arc<Self> {
        let backend = Self::new();
        backend.set_create_failing(true);
        backend
    }

    pub fn client_factory(self: &Arc<Self>) -> Arc<dyn ClientFactory> {
        Arc::new(FakeClientFactory {
            backend: Arc::clone(self),
        })
    }

    pub fn set_create_failing(&self, failing: bool) {
        self.create_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_probe_failing(&self, failing: bool) {
        self.probe_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_query_failing(&self, failing: bool) {
        self.query_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = delay;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn set_push(&self, behavior: PushBehavior) {
        *self.push.lock() = behavior;
    }

    /// Results returned by successive queries; the last one repeats
    pub fn script_queries(&self, results: Vec<Vec<Row>>) {
        *self.query_script.lock() = results.into();
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn channel_opens(&self) -> usize {
        self.channel_opens.load(Ordering::SeqCst)
    }

    /// Channels opened and not yet unsubscribed
    pub fn open_channels(&self) -> usize {
        self.channel_opens.load(Ordering::SeqCst) - self.channel_closes.load(Ordering::SeqCst)
    }

    /// Deliver a row event on the channel serving `key`
    pub fn emit(&self, key: &str, kind: ChangeKind, row: Row) -> bool {
        let topic = ResourceSelector::channel_topic(key);
        match self.sinks.lock().get(&topic) {
            Some(sink) => sink
                .send(ChannelEvent::Change(ChangeEvent::pushed(
                    key,
                    kind,
                    Some(row),
                    None,
                )))
                .is_ok(),
            None => false,
        }
    }

    /// Report CLOSED on the channel serving `key`, as a backend drop would
    pub fn close_channel(&self, key: &str) -> bool {
        let topic = ResourceSelector::channel_topic(key);
        match self.sinks.lock().get(&topic) {
            Some(sink) => sink.send(ChannelEvent::Status(ChannelStatus::Closed)).is_ok(),
            None => false,
        }
    }
}

struct FakeClientFactory {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn create_client(
        &self,
        _endpoint: &BackendEndpoint,
    ) -> SyncResult<Arc<dyn RealtimeClient>> {
        self.backend.creates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.backend.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.backend.create_failing.load(Ordering::SeqCst) {
            return Err(SyncError::client_creation("backend unreachable"));
        }
        Ok(Arc::new(FakeClient {
            backend: Arc::clone(&self.backend),
        }))
    }
}

struct FakeClient {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl RealtimeClient for FakeClient {
    async fn probe(&self) -> SyncResult<()> {
        self.backend.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.backend.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.backend.probe_failing.load(Ordering::SeqCst) {
            Err(SyncError::probe("select 1 failed"))
        } else {
            Ok(())
        }
    }

    async fn open_channel(
        &self,
        topic: &str,
        _resource: &ResourceSelector,
        sink: ChannelSink,
    ) -> SyncResult<Box<dyn RealtimeChannel>> {
        let delay = *self.backend.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.backend.channel_opens.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.backend.push.lock();
        match behavior {
            PushBehavior::Subscribe => {
                let _ = sink.send(ChannelEvent::Status(ChannelStatus::Subscribed));
            }
            PushBehavior::Reject => {
                let _ = sink.send(ChannelEvent::Status(ChannelStatus::ChannelError(
                    "permission denied".to_string(),
                )));
            }
            PushBehavior::Silent => {}
        }
        self.backend.sinks.lock().insert(topic.to_string(), sink);

        Ok(Box::new(FakeChannel {
            topic: topic.to_string(),
            backend: Arc::clone(&self.backend),
        }))
    }

    async fn query(&self, _resource: &ResourceSelector) -> SyncResult<Vec<Row>> {
        self.backend.queries.fetch_add(1, Ordering::SeqCst);
        if self.backend.query_failing.load(Ordering::SeqCst) {
            return Err(SyncError::probe("query failed"));
        }

        let mut last = self.backend.last_rows.lock();
        if let Some(next) = self.backend.query_script.lock().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

struct FakeChannel {
    topic: String,
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl RealtimeChannel for FakeChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self) -> SyncResult<()> {
        self.backend.channel_closes.fetch_add(1, Ordering::SeqCst);
        self.backend.sinks.lock().remove(&self.topic);
        Ok(())
    }
}
