// SQLite StateStore Implementation

use std::collections::BTreeMap;

use async_trait::async_trait;
use geoflow_core::domain::{JobRecord, JobStatus, StageSummary, TaskRecord, TaskResult};
use geoflow_core::error::{EngineError, Result};
use geoflow_core::port::{StageCompletion, StateStore, TaskOutcome, TimeProvider};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;
use tracing::debug;

use crate::connection::PoolHandle;

const TERMINAL_JOB_STATUSES: &str = "'COMPLETED', 'COMPLETED_WITH_ERRORS', 'FAILED'";
const TERMINAL_TASK_STATUSES: &str = "'COMPLETED', 'FAILED'";

// Helper to convert sqlx::Error to EngineError with structured information
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> EngineError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();
                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    "2067" | "1555" => EngineError::AlreadyExists(format!(
                        "unique constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "787" | "3850" => EngineError::Database(format!(
                        "foreign key constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "5" => EngineError::Database(format!(
                        "database locked (SQLITE_BUSY): {}",
                        db_err.message()
                    )),
                    "13" => {
                        EngineError::Database(format!("database full: {}", db_err.message()))
                    }
                    _ => EngineError::Database(format!(
                        "database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                EngineError::Database(format!("database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => EngineError::Database("row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            EngineError::Database(format!("column not found: {col}"))
        }
        _ => EngineError::Database(err.to_string()),
    }
}

fn parse_json_column(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

/// SQLite row representation of a job
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    job_type: String,
    status: String,
    stage: i64,
    total_stages: i64,
    parameters: String,
    stage_results: Option<String>,
    result_data: Option<String>,
    error_details: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord> {
        let stage_results: BTreeMap<u32, StageSummary> = match self.stage_results {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };
        Ok(JobRecord {
            job_id: self.job_id,
            job_type: self.job_type,
            parameters: serde_json::from_str(&self.parameters)?,
            status: self.status.parse()?,
            stage: self.stage as u32,
            total_stages: self.total_stages as u32,
            stage_results,
            result_data: parse_json_column(self.result_data)?,
            error_details: self.error_details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// SQLite row representation of a task
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    parent_job_id: String,
    job_type: String,
    task_type: String,
    stage: i64,
    task_index: i64,
    status: String,
    parameters: String,
    result_data: Option<String>,
    error_details: Option<String>,
    retry_count: i64,
    checkpoint_phase: i64,
    checkpoint_data: Option<String>,
    checkpoint_updated_at: Option<i64>,
    execution_started_at: Option<i64>,
    target_queue: String,
    executed_by_app: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_record(self) -> Result<TaskRecord> {
        Ok(TaskRecord {
            task_id: self.task_id,
            parent_job_id: self.parent_job_id,
            job_type: self.job_type,
            task_type: self.task_type,
            stage: self.stage as u32,
            task_index: self.task_index as u32,
            parameters: serde_json::from_str(&self.parameters)?,
            status: self.status.parse()?,
            retry_count: self.retry_count as i32,
            result_data: parse_json_column(self.result_data)?,
            error_details: self.error_details,
            checkpoint_phase: self.checkpoint_phase as u32,
            checkpoint_data: parse_json_column(self.checkpoint_data)?,
            checkpoint_updated_at: self.checkpoint_updated_at,
            execution_started_at: self.execution_started_at,
            target_queue: self.target_queue,
            executed_by_app: self.executed_by_app,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn task_result_from_row(row: &SqliteRow) -> Result<TaskResult> {
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;
    let result_raw: Option<String> = row.try_get("result_data").map_err(map_sqlx_error)?;
    let task_index: i64 = row.try_get("task_index").map_err(map_sqlx_error)?;
    Ok(TaskResult {
        task_id: row.try_get("task_id").map_err(map_sqlx_error)?,
        task_index: task_index as u32,
        task_type: row.try_get("task_type").map_err(map_sqlx_error)?,
        success: status == "COMPLETED",
        result: parse_json_column(result_raw)?,
        error: row.try_get("error_details").map_err(map_sqlx_error)?,
    })
}

pub struct SqliteStateStore {
    pool: PoolHandle,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteStateStore {
    pub fn new(pool: PoolHandle, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        let pool = self.pool.current().await;
        let stage_results = serde_json::to_string(&job.stage_results)?;
        let result_data = job.result_data.as_ref().map(|v| v.to_string());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, job_type, status, stage, total_stages,
                parameters, stage_results, result_data, error_details,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.job_type)
        .bind(job.status.to_string())
        .bind(job.stage as i64)
        .bind(job.total_stages as i64)
        .bind(job.parameters.to_string())
        .bind(&stage_results)
        .bind(&result_data)
        .bind(&job.error_details)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let pool = self.pool.current().await;
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(JobRow::into_record).transpose()
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let pool = self.pool.current().await;
        let current_raw: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&pool)
                .await
                .map_err(map_sqlx_error)?;
        let current: JobStatus = current_raw
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?
            .parse()?;

        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition(format!(
                "job {job_id}: {current} -> {status}"
            )));
        }

        let now = self.time_provider.now_millis();
        // Conditional on the observed status so a racing transition cannot
        // be silently overwritten
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, updated_at = ? WHERE job_id = ? AND status = ?",
        )
        .bind(status.to_string())
        .bind(now)
        .bind(job_id)
        .bind(current.to_string())
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::InvalidTransition(format!(
                "job {job_id}: concurrent status change while applying {current} -> {status}"
            )));
        }
        Ok(())
    }

    async fn update_job_stage(&self, job_id: &str, stage: u32) -> Result<()> {
        let pool = self.pool.current().await;
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            "UPDATE jobs SET stage = MAX(stage, ?), updated_at = ? WHERE job_id = ?",
        )
        .bind(stage as i64)
        .bind(now)
        .bind(job_id)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    async fn set_stage_result(
        &self,
        job_id: &str,
        stage: u32,
        summary: &StageSummary,
    ) -> Result<()> {
        let pool = self.pool.current().await;
        // Stage advancement is exclusive per job, so read-modify-write of
        // the summary map cannot race with itself
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT stage_results FROM jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&pool)
                .await
                .map_err(map_sqlx_error)?;
        let raw = raw.ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;

        let mut results: BTreeMap<u32, StageSummary> = match raw {
            Some(json) => serde_json::from_str(&json)?,
            None => BTreeMap::new(),
        };
        results.insert(stage, summary.clone());

        let now = self.time_provider.now_millis();
        sqlx::query("UPDATE jobs SET stage_results = ?, updated_at = ? WHERE job_id = ?")
            .bind(serde_json::to_string(&results)?)
            .bind(now)
            .bind(job_id)
            .execute(&pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: Option<&serde_json::Value>,
        error_details: Option<&str>,
    ) -> Result<()> {
        let pool = self.pool.current().await;
        let now = self.time_provider.now_millis();
        let result = sqlx::query(&format!(
            "UPDATE jobs SET status = ?, result_data = ?, error_details = ?, updated_at = ? \
             WHERE job_id = ? AND status NOT IN ({TERMINAL_JOB_STATUSES})"
        ))
        .bind(status.to_string())
        .bind(result_data.map(|v| v.to_string()))
        .bind(error_details)
        .bind(now)
        .bind(job_id)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = ?")
                    .bind(job_id)
                    .fetch_optional(&pool)
                    .await
                    .map_err(map_sqlx_error)?;
            return match current {
                None => Err(EngineError::NotFound(format!("job {job_id}"))),
                // Idempotent replay of the same finalization
                Some(s) if s == status.to_string() => Ok(()),
                Some(s) => Err(EngineError::InvalidTransition(format!(
                    "job {job_id} already terminal: {s}"
                ))),
            };
        }
        Ok(())
    }

    async fn upsert_task(&self, task: &TaskRecord) -> Result<bool> {
        let pool = self.pool.current().await;
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, parent_job_id, job_type, task_type, stage, task_index,
                status, parameters, result_data, error_details, retry_count,
                checkpoint_phase, checkpoint_data, checkpoint_updated_at,
                execution_started_at, target_queue, executed_by_app,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.parent_job_id)
        .bind(&task.job_type)
        .bind(&task.task_type)
        .bind(task.stage as i64)
        .bind(task.task_index as i64)
        .bind(task.status.to_string())
        .bind(task.parameters.to_string())
        .bind(task.result_data.as_ref().map(|v| v.to_string()))
        .bind(&task.error_details)
        .bind(task.retry_count)
        .bind(task.checkpoint_phase as i64)
        .bind(task.checkpoint_data.as_ref().map(|v| v.to_string()))
        .bind(task.checkpoint_updated_at)
        .bind(task.execution_started_at)
        .bind(&task.target_queue)
        .bind(&task.executed_by_app)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let pool = self.pool.current().await;
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(TaskRow::into_record).transpose()
    }

    async fn mark_task_processing(
        &self,
        task_id: &str,
        started_at: i64,
        executed_by: &str,
        retry_count: i32,
    ) -> Result<TaskRecord> {
        let pool = self.pool.current().await;
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'PROCESSING',
                execution_started_at = COALESCE(execution_started_at, ?),
                executed_by_app = ?,
                retry_count = ?,
                updated_at = ?
            WHERE task_id = ? AND status IN ('PENDING', 'PROCESSING')
            RETURNING *
            "#,
        )
        .bind(started_at)
        .bind(executed_by)
        .bind(retry_count)
        .bind(started_at)
        .bind(task_id)
        .fetch_optional(&pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => row.into_record(),
            None => {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
                        .bind(task_id)
                        .fetch_optional(&pool)
                        .await
                        .map_err(map_sqlx_error)?;
                match current {
                    None => Err(EngineError::NotFound(format!("task {task_id}"))),
                    Some(s) => Err(EngineError::InvalidTransition(format!(
                        "task {task_id}: {s} -> PROCESSING"
                    ))),
                }
            }
        }
    }

    async fn update_task_checkpoint(
        &self,
        task_id: &str,
        phase: u32,
        payload: &serde_json::Value,
        updated_at: i64,
    ) -> Result<()> {
        let pool = self.pool.current().await;
        let result = sqlx::query(&format!(
            "UPDATE tasks \
             SET checkpoint_phase = ?, checkpoint_data = ?, \
                 checkpoint_updated_at = ?, updated_at = ? \
             WHERE task_id = ? AND checkpoint_phase <= ? \
               AND status NOT IN ({TERMINAL_TASK_STATUSES})"
        ))
        .bind(phase as i64)
        .bind(payload.to_string())
        .bind(updated_at)
        .bind(updated_at)
        .bind(task_id)
        .bind(phase as i64)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_optional(&pool)
                    .await
                    .map_err(map_sqlx_error)?;
            return match exists {
                None => Err(EngineError::NotFound(format!("task {task_id}"))),
                Some(_) => Err(EngineError::InvalidTransition(format!(
                    "task {task_id}: checkpoint write rejected (terminal task or phase regression)"
                ))),
            };
        }
        Ok(())
    }

    async fn touch_task(&self, task_id: &str, updated_at: i64) -> Result<()> {
        let pool = self.pool.current().await;
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE task_id = ?")
            .bind(updated_at)
            .bind(task_id)
            .execute(&pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<TaskRecord>> {
        let pool = self.pool.current().await;
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE parent_job_id = ? ORDER BY stage ASC, task_index ASC",
        )
        .bind(job_id)
        .fetch_all(&pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn get_completed_tasks_for_stage(
        &self,
        job_id: &str,
        stage: u32,
    ) -> Result<Vec<TaskResult>> {
        let pool = self.pool.current().await;
        let rows = sqlx::query(
            r#"
            SELECT task_id, task_index, task_type, status, result_data, error_details
            FROM tasks
            WHERE parent_job_id = ? AND stage = ? AND status = 'COMPLETED'
            ORDER BY task_index ASC
            "#,
        )
        .bind(job_id)
        .bind(stage as i64)
        .fetch_all(&pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(task_result_from_row).collect()
    }

    async fn get_failed_tasks(&self, job_id: &str) -> Result<Vec<TaskResult>> {
        let pool = self.pool.current().await;
        let rows = sqlx::query(
            r#"
            SELECT task_id, task_index, task_type, status, result_data, error_details
            FROM tasks
            WHERE parent_job_id = ? AND status = 'FAILED'
            ORDER BY stage ASC, task_index ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(task_result_from_row).collect()
    }

    async fn complete_task_and_check_stage(
        &self,
        task_id: &str,
        job_id: &str,
        stage: u32,
        outcome: &TaskOutcome,
    ) -> Result<StageCompletion> {
        let pool = self.pool.current().await;
        let now = self.time_provider.now_millis();
        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

        // Advisory lock: the first write of the transaction targets the
        // (job_id, stage) coordination row, so concurrent completers of the
        // same stage serialize here for the rest of the transaction.
        sqlx::query(
            r#"
            INSERT INTO stage_advance_locks (job_id, stage, locked_at)
            VALUES (?, ?, ?)
            ON CONFLICT(job_id, stage) DO UPDATE SET locked_at = excluded.locked_at
            "#,
        )
        .bind(job_id)
        .bind(stage as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        // Terminal write; a no-op if the task already finished (duplicate
        // completion from a redelivery)
        let updated = sqlx::query(&format!(
            "UPDATE tasks SET status = ?, result_data = ?, error_details = ?, updated_at = ? \
             WHERE task_id = ? AND status NOT IN ({TERMINAL_TASK_STATUSES})"
        ))
        .bind(outcome.status.to_string())
        .bind(outcome.result_data.as_ref().map(|v| v.to_string()))
        .bind(&outcome.error_details)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        let transitioned = updated.rows_affected() > 0;

        let (total, succeeded, failed, remaining): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status NOT IN ('COMPLETED', 'FAILED') THEN 1 ELSE 0 END), 0)
            FROM tasks
            WHERE parent_job_id = ? AND stage = ?
            "#,
        )
        .bind(job_id)
        .bind(stage as i64)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let completion = StageCompletion {
            // Only the call that wrote the final terminal status wins
            stage_complete: transitioned && remaining == 0,
            total,
            succeeded,
            failed,
        };
        debug!(
            task_id = %task_id,
            job_id = %job_id,
            stage = stage,
            transitioned = transitioned,
            remaining = remaining,
            "completion check"
        );
        Ok(completion)
    }
}
