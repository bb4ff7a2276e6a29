// Task Domain Model

use serde::{Deserialize, Serialize};

use crate::domain::error::{DomainError, Result};
use crate::domain::job::JobId;

/// Task ID (SHA-256 hash of job_id + stage + task_type + task_index,
/// stable across retries)
pub type TaskId = String;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// PENDING -> PROCESSING -> {COMPLETED, FAILED}.
    /// PROCESSING -> PROCESSING is a redelivery no-op.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => next == TaskStatus::Processing,
            TaskStatus::Processing => next != TaskStatus::Pending,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Processing => write!(f, "PROCESSING"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(DomainError::Internal(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Task entity: one unit of work within a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub parent_job_id: JobId,
    pub job_type: String,
    pub task_type: String,
    pub stage: u32,
    pub task_index: u32,
    pub parameters: serde_json::Value,
    pub status: TaskStatus,

    pub retry_count: i32,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<String>,

    /// Checkpoint milestone within a long-running task; 0 = none.
    /// Monotonically non-decreasing while the task is non-terminal.
    pub checkpoint_phase: u32,
    pub checkpoint_data: Option<serde_json::Value>,
    pub checkpoint_updated_at: Option<i64>,

    /// Set on the first transition into PROCESSING, preserved on redelivery.
    pub execution_started_at: Option<i64>,

    pub target_queue: String,
    pub executed_by_app: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: impl Into<String>,
        parent_job_id: impl Into<String>,
        job_type: impl Into<String>,
        task_type: impl Into<String>,
        stage: u32,
        task_index: u32,
        parameters: serde_json::Value,
        target_queue: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            parent_job_id: parent_job_id.into(),
            job_type: job_type.into(),
            task_type: task_type.into(),
            stage,
            task_index,
            parameters,
            status: TaskStatus::Pending,
            retry_count: 0,
            result_data: None,
            error_details: None,
            checkpoint_phase: 0,
            checkpoint_data: None,
            checkpoint_updated_at: None,
            execution_started_at: None,
            target_queue: target_queue.into(),
            executed_by_app: None,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Per-task summary flowing into the next stage (and into fan_in inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_index: u32,
    pub task_type: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}
