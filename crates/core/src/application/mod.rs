// Application Layer - orchestration services around the domain

pub mod builtin;
pub mod checkpoint;
pub mod handler;
pub mod machine;
pub mod registry;
pub mod router;
pub mod submission;
pub mod worker;

// Re-exports
pub use checkpoint::{ArtifactValidator, CheckpointHandle, CheckpointManager};
pub use handler::{HandlerResult, ProgressSink, StoreProgressSink, TaskContext, TaskHandler};
pub use machine::{CoreMachine, DeliveryInfo, Disposition, ExecutionEnv};
pub use registry::{HandlerRegistry, Workflow, WorkflowRegistry};
pub use router::{RouterConfig, TaskRouter};
pub use submission::{SubmissionReceipt, SubmissionService, SubmissionStatus};
pub use worker::{
    QueueKind, QueueWorker, QueueWorkerOptions, ShortLivedWorker, ShutdownSignal,
};
