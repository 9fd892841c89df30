#![allow(dead_code)]

pub mod fake_backend;

pub use fake_backend::{FakeBackend, PushBehavior};

use parking_lot::Mutex;
use realtime_sync::{ChangeEvent, ResourceSelector, SubscriptionConfig, SyncConfig, SyncError};
use std::sync::Arc;

/// Install a test subscriber once; later calls are no-ops
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("realtime_sync=debug")
        .with_test_writer()
        .try_init();
}

/// Defaults with a single attempt per connection sequence and no jitter,
/// so scenarios count backend calls exactly
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_max_retries(1)
        .with_max_jitter_ms(0)
}

/// Collects what a topic's handler receives
#[derive(Default)]
pub struct Recorder {
    pub changes: Mutex<Vec<ChangeEvent>>,
    pub errors: Mutex<Vec<SyncError>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscription(self: &Arc<Self>, key: &str, table: &str) -> SubscriptionConfig {
        let changes = Arc::clone(self);
        let errors = Arc::clone(self);
        SubscriptionConfig::with_callbacks(
            key,
            ResourceSelector::table(table),
            move |event| changes.changes.lock().push(event),
            move |error| errors.errors.lock().push(error.clone()),
        )
    }

    pub fn change_count(&self) -> usize {
        self.changes.lock().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }
}
