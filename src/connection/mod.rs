//! Connection management: the shared health snapshot and the factory that
//! owns the single backend client.

pub mod factory;
pub mod health;

pub use factory::{ConnectionFactory, FactoryStatsSnapshot};
pub use health::{ConnectionHealth, ConnectionStatus};
