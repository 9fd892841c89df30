//! Topic handlers receive change events and per-topic errors.

use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::backend::{ChangeEvent, ResourceSelector};
use crate::error::SyncError;

/// Trait for handling a topic's change notifications
///
/// Events for one topic are delivered in the order its active transport
/// observed them. Handlers run on the transport's task and should return
/// quickly.
pub trait TopicHandler: Send + Sync {
    /// Handle a change event
    fn on_change(&self, event: ChangeEvent);

    /// Handle a transport error affecting this topic only
    fn on_error(&self, error: &SyncError) {
        warn!(error = %error, "Unhandled topic transport error");
    }
}

type ChangeCallback = Box<dyn Fn(ChangeEvent) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&SyncError) + Send + Sync>;

/// Adapts closures to [`TopicHandler`]
pub struct CallbackHandler {
    on_change: ChangeCallback,
    on_error: Option<ErrorCallback>,
}

impl CallbackHandler {
    pub fn new<F>(on_change: F) -> Self
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        Self {
            on_change: Box::new(on_change),
            on_error: None,
        }
    }

    pub fn with_error_handler<E>(mut self, on_error: E) -> Self
    where
        E: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }
}

impl TopicHandler for CallbackHandler {
    fn on_change(&self, event: ChangeEvent) {
        (self.on_change)(event)
    }

    fn on_error(&self, error: &SyncError) {
        match &self.on_error {
            Some(callback) => callback(error),
            None => warn!(error = %error, "Topic error without error handler"),
        }
    }
}

/// A desired subscription: topic key, resource and handler
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub key: String,
    pub resource: ResourceSelector,
    pub handler: Arc<dyn TopicHandler>,
}

impl SubscriptionConfig {
    /// Subscribe with a change callback
    pub fn new<F>(key: impl Into<String>, resource: ResourceSelector, on_change: F) -> Self
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        Self::with_handler(key, resource, Arc::new(CallbackHandler::new(on_change)))
    }

    /// Subscribe with change and error callbacks
    pub fn with_callbacks<F, E>(
        key: impl Into<String>,
        resource: ResourceSelector,
        on_change: F,
        on_error: E,
    ) -> Self
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
        E: Fn(&SyncError) + Send + Sync + 'static,
    {
        Self::with_handler(
            key,
            resource,
            Arc::new(CallbackHandler::new(on_change).with_error_handler(on_error)),
        )
    }

    /// Subscribe with a handler implementation
    pub fn with_handler(
        key: impl Into<String>,
        resource: ResourceSelector,
        handler: Arc<dyn TopicHandler>,
    ) -> Self {
        Self {
            key: key.into(),
            resource,
            handler,
        }
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("key", &self.key)
            .field("resource", &self.resource)
            .finish()
    }
}
