//! Topic subscriptions: what callers register and the registry that keeps
//! each topic on a working transport.

pub mod handler;
pub mod registry;

pub use handler::{CallbackHandler, SubscriptionConfig, TopicHandler};
pub use registry::{
    RegistryMode, RegistryStatsSnapshot, RegistryStatus, SubscriptionRegistry,
};
