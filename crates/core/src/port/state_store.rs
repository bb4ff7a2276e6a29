// StateStore Port (Interface)
//
// The single owner of durable Job/Task rows. No other component writes
// these rows directly; checkpoint columns are written only through the
// CheckpointManager, which delegates here.

use async_trait::async_trait;

use crate::domain::{JobRecord, JobStatus, StageSummary, TaskRecord, TaskResult, TaskStatus};
use crate::error::Result;

/// Outcome of the atomic stage-completion check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCompletion {
    /// True iff every task of the stage is terminal AND this call is the
    /// one that made it so. The last-task-turns-out-the-lights winner.
    pub stage_complete: bool,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Terminal write applied by `complete_task_and_check_stage`.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<String>,
}

impl TaskOutcome {
    pub fn completed(result_data: Option<serde_json::Value>) -> Self {
        Self {
            status: TaskStatus::Completed,
            result_data,
            error_details: None,
        }
    }

    pub fn failed(error_details: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result_data: None,
            error_details: Some(error_details.into()),
        }
    }
}

/// Durable transactional store for Job/Task records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a new job. Fails with `EngineError::AlreadyExists` if the
    /// job_id is taken.
    async fn create_job(&self, job: &JobRecord) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Validated status transition. Duplicate transitions (same status)
    /// succeed without effect; invalid ones fail with InvalidTransition.
    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<()>;

    /// Monotonic: a stage lower than the current one is ignored.
    async fn update_job_stage(&self, job_id: &str, stage: u32) -> Result<()>;

    /// Record the aggregated summary for a fully completed stage.
    async fn set_stage_result(
        &self,
        job_id: &str,
        stage: u32,
        summary: &StageSummary,
    ) -> Result<()>;

    /// Terminal write for the job: status + result_data + error_details.
    /// Guarded by the terminal-sink rule.
    async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: Option<&serde_json::Value>,
        error_details: Option<&str>,
    ) -> Result<()>;

    /// Idempotent on task_id: returns true if the row was inserted, false
    /// if it already existed (retried stage dispatch).
    async fn upsert_task(&self, task: &TaskRecord) -> Result<bool>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Transition a task into PROCESSING. Sets `execution_started_at` on the
    /// first entry only; PROCESSING -> PROCESSING is the redelivery no-op.
    /// Returns the updated row.
    async fn mark_task_processing(
        &self,
        task_id: &str,
        started_at: i64,
        executed_by: &str,
        retry_count: i32,
    ) -> Result<TaskRecord>;

    /// Monotonic checkpoint write; rejected once the task is terminal.
    async fn update_task_checkpoint(
        &self,
        task_id: &str,
        phase: u32,
        payload: &serde_json::Value,
        updated_at: i64,
    ) -> Result<()>;

    /// Advisory progress touch (no semantic effect).
    async fn touch_task(&self, task_id: &str, updated_at: i64) -> Result<()>;

    /// All tasks of a job, ordered by stage then task_index (operator
    /// surface).
    async fn list_tasks(&self, job_id: &str) -> Result<Vec<TaskRecord>>;

    /// Results of COMPLETED tasks for a stage, ordered by task_index.
    async fn get_completed_tasks_for_stage(
        &self,
        job_id: &str,
        stage: u32,
    ) -> Result<Vec<TaskResult>>;

    /// All FAILED tasks of a job (error aggregation at finalization).
    async fn get_failed_tasks(&self, job_id: &str) -> Result<Vec<TaskResult>>;

    /// The critical atomic primitive: under an advisory lock keyed by
    /// (job_id, stage), write the task's terminal outcome, count the
    /// stage's tasks by status, and report whether THIS call completed the
    /// stage. At most one call per (job_id, stage) observes
    /// `stage_complete = true`.
    async fn complete_task_and_check_stage(
        &self,
        task_id: &str,
        job_id: &str,
        stage: u32,
        outcome: &TaskOutcome,
    ) -> Result<StageCompletion>;
}
