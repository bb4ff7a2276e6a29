// Port Layer - Interfaces for external dependencies

pub mod maintenance;
pub mod message_broker;
pub mod providers;
pub mod state_store;

// Re-exports
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceStats};
pub use message_broker::{DeadLetteredMessage, DeliveredMessage, MessageBroker};
pub use providers::{IdProvider, SystemTimeProvider, TimeProvider, UuidProvider};
pub use state_store::{StageCompletion, StateStore, TaskOutcome};
