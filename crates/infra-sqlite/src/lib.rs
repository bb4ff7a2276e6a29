// GeoFlow Infrastructure - SQLite Adapters
// Implements: StateStore, MessageBroker, Maintenance

mod broker;
mod connection;
mod maintenance_impl;
mod migration;
mod state_store;

pub use broker::{BrokerConfig, QueueOptions, SqliteMessageBroker};
pub use connection::{create_pool, PoolHandle};
pub use maintenance_impl::SqliteMaintenance;
pub use migration::run_migrations;
pub use state_store::SqliteStateStore;

// Note: sqlx::Error conversion is wrapped in helper functions here; Rust's
// orphan rules prevent a From<sqlx::Error> impl for EngineError.
