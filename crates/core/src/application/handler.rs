// Task Handler Contract
//
// Handlers are the opaque callables behind each task_type (raster
// reprojection, COG creation, STAC extraction, ...). They must be
// idempotent: a second invocation with the same task_id and checkpoint
// state converges to the same terminal outcome.

use std::sync::Arc;

use async_trait::async_trait;

use crate::application::checkpoint::CheckpointHandle;
use crate::application::worker::ShutdownSignal;

/// Outcome reported by a task handler.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    /// Transient failure; the message is abandoned and redelivered up to
    /// the queue's max delivery count.
    pub retryable: bool,
    /// Work was cut short by shutdown after a checkpoint save. The task
    /// stays non-terminal and the message is abandoned, never completed.
    pub interrupted: bool,
    pub phase_completed: Option<u32>,
    pub resumable: bool,
}

impl HandlerResult {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            error_code: None,
            retryable: false,
            interrupted: false,
            phase_completed: None,
            resumable: false,
        }
    }

    pub fn ok_empty() -> Self {
        Self::ok(serde_json::Value::Null)
    }

    /// Permanent failure: the task goes FAILED and counts toward stage
    /// completion.
    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            error_code: None,
            retryable: false,
            interrupted: false,
            phase_completed: None,
            resumable: false,
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Transient failure: abandon and retry.
    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::permanent(error)
        }
    }

    /// Shutdown observed between phases; resume from checkpoint on
    /// redelivery.
    pub fn interrupted(phase_completed: u32) -> Self {
        Self {
            success: true,
            result: None,
            error: None,
            error_code: None,
            retryable: false,
            interrupted: true,
            phase_completed: Some(phase_completed),
            resumable: true,
        }
    }
}

/// Advisory progress reporting (no semantic effect).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, task_id: &str, percent: u8, message: &str);
}

/// Default sink: structured log line plus a touch of the task row's
/// `updated_at`, so operators can spot stalled tasks.
pub struct StoreProgressSink {
    store: Arc<dyn crate::port::StateStore>,
    time: Arc<dyn crate::port::TimeProvider>,
}

impl StoreProgressSink {
    pub fn new(
        store: Arc<dyn crate::port::StateStore>,
        time: Arc<dyn crate::port::TimeProvider>,
    ) -> Self {
        Self { store, time }
    }
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn report(&self, task_id: &str, percent: u8, message: &str) {
        tracing::info!(task_id = %task_id, percent = percent, "progress: {message}");
        if let Err(e) = self.store.touch_task(task_id, self.time.now_millis()).await {
            // Advisory only; never fail the handler over it
            tracing::debug!(task_id = %task_id, error = %e, "progress touch failed");
        }
    }
}

/// Execution context handed to a handler alongside the task parameters.
///
/// Short-lived contexts carry only identity; long-running contexts add the
/// checkpoint handle and shutdown awareness.
pub struct TaskContext {
    pub task_id: String,
    pub job_id: String,
    checkpoint: Option<Arc<CheckpointHandle>>,
    shutdown: Option<ShutdownSignal>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl TaskContext {
    /// Serverless context: hard runtime deadline, no checkpoint, no
    /// shutdown awareness.
    pub fn short(task_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            job_id: job_id.into(),
            checkpoint: None,
            shutdown: None,
            progress: None,
        }
    }

    /// Long-running container context.
    pub fn long(
        task_id: impl Into<String>,
        job_id: impl Into<String>,
        checkpoint: Arc<CheckpointHandle>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            job_id: job_id.into(),
            checkpoint: Some(checkpoint),
            shutdown: Some(shutdown),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Checkpoint handle; None in short-lived contexts.
    pub fn checkpoint(&self) -> Option<&Arc<CheckpointHandle>> {
        self.checkpoint.as_ref()
    }

    /// True once SIGTERM/SIGINT was received. Always false in short-lived
    /// contexts.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().map(|s| s.is_set()).unwrap_or(false)
    }

    pub async fn report_progress(&self, percent: u8, message: &str) {
        if let Some(progress) = &self.progress {
            progress.report(&self.task_id, percent, message).await;
        } else {
            tracing::debug!(
                task_id = %self.task_id,
                percent = percent,
                "progress: {message}"
            );
        }
    }
}

/// The `task_type -> callable` contract.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, parameters: &serde_json::Value, ctx: &TaskContext) -> HandlerResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRecord;
    use crate::port::StateStore;
    use crate::testing::{FixedTimeProvider, MemoryStateStore};
    use serde_json::json;

    #[tokio::test]
    async fn report_progress_touches_the_task_row() {
        let store = Arc::new(MemoryStateStore::new());
        let time = Arc::new(FixedTimeProvider::new(1_000));
        let task = TaskRecord::new(
            "t1", "j1", "echo", "echo", 1, 0,
            json!({}), "tasks-short", 1_000,
        );
        store.upsert_task(&task).await.unwrap();

        let sink: Arc<dyn ProgressSink> =
            Arc::new(StoreProgressSink::new(store.clone(), time.clone()));
        let ctx = TaskContext::short("t1", "j1").with_progress(sink);

        time.advance(5_000);
        ctx.report_progress(40, "reprojecting tile 2/5").await;

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.updated_at, 6_000);
    }

    #[test]
    fn short_context_has_no_checkpoint_or_shutdown() {
        let ctx = TaskContext::short("t1", "j1");
        assert!(ctx.checkpoint().is_none());
        assert!(!ctx.shutdown_requested());
    }
}
