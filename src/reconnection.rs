//! # Reconnection Scheduler
//!
//! While any topic is served by polling, a recurring task tries to bring the
//! push transport back for the whole registry. The task exists only while
//! there is something to recover: it stops itself once no topic is polling,
//! and scheduling it again while it runs has no effect.
//!
//! ```rust
//! use async_trait::async_trait;
//! use realtime_sync::reconnection::{ReconnectionScheduler, RecoveryTarget};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct AlwaysPolling;
//!
//! #[async_trait]
//! impl RecoveryTarget for AlwaysPolling {
//!     async fn attempt_recovery(&self) -> usize {
//!         1
//!     }
//!
//!     fn polling_topic_count(&self) -> usize {
//!         1
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let target: Arc<dyn RecoveryTarget> = Arc::new(AlwaysPolling);
//! let scheduler = ReconnectionScheduler::new(Duration::from_secs(60));
//!
//! assert!(scheduler.ensure_scheduled(Arc::downgrade(&target)));
//! assert!(!scheduler.ensure_scheduled(Arc::downgrade(&target)));
//!
//! scheduler.stop().await;
//! assert!(!scheduler.is_running());
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Something the scheduler can try to recover on each tick
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Try to move polling topics back to push; returns how many still poll
    async fn attempt_recovery(&self) -> usize;

    /// Topics currently served by polling
    fn polling_topic_count(&self) -> usize;
}

/// Drives periodic recovery attempts while the registry is degraded
pub struct ReconnectionScheduler {
    interval: Duration,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    ticks: Arc<AtomicU64>,
}

impl std::fmt::Debug for ReconnectionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionScheduler")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl ReconnectionScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: Arc::new(Mutex::new(None)),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the recurring task unless it is already running
    ///
    /// Returns `true` if a new task was started. Nothing is started while the
    /// target has no polling topics.
    pub fn ensure_scheduled(&self, target: Weak<dyn RecoveryTarget>) -> bool {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        match target.upgrade() {
            Some(live) if live.polling_topic_count() > 0 => {}
            _ => return false,
        }

        let period = self.interval;
        let task_slot = Arc::clone(&self.task);
        let ticks = Arc::clone(&self.ticks);

        info!(
            interval_ms = period.as_millis() as u64,
            "⏰ Scheduling push reconnection attempts"
        );

        *slot = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(target) = target.upgrade() else {
                    break;
                };

                let tick = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                let remaining = target.attempt_recovery().await;
                debug!(tick, remaining, "Reconnection tick finished");

                if remaining == 0 {
                    // Re-check under the slot lock so a topic that starts
                    // polling right now still finds a running scheduler
                    let mut slot = task_slot.lock();
                    if target.polling_topic_count() == 0 {
                        slot.take();
                        info!(tick, "All topics recovered; reconnection scheduler stopped");
                        break;
                    }
                }
            }
        }));

        true
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Ticks completed since creation
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Cancel the recurring task, including a tick in progress
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            debug!("Reconnection scheduler stopped");
        }
    }
}
