// Domain Layer - Pure orchestration entities and state machines

pub mod error;
pub mod identity;
pub mod job;
pub mod message;
pub mod task;
pub mod workflow;

// Re-exports
pub use error::DomainError;
pub use job::{JobId, JobRecord, JobStatus, StageSummary};
pub use message::{JobMessage, TaskMessage};
pub use task::{TaskId, TaskRecord, TaskResult, TaskStatus};
pub use workflow::{
    FailurePolicy, Parallelism, StageDefinition, TaskDescriptor, PREVIOUS_RESULTS_KEY,
};
