// SQLite Maintenance Implementation

use std::sync::Arc;

use async_trait::async_trait;
use geoflow_core::error::Result;
use geoflow_core::port::{Maintenance, MaintenanceStats, TimeProvider};
use tracing::info;

use crate::connection::PoolHandle;
use crate::state_store::map_sqlx_error;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const TERMINAL_JOB_STATUSES: &str = "'COMPLETED', 'COMPLETED_WITH_ERRORS', 'FAILED'";

pub struct SqliteMaintenance {
    pool: PoolHandle,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteMaintenance {
    pub fn new(pool: PoolHandle, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    async fn db_size_bytes(&self) -> Result<i64> {
        let pool = self.pool.current().await;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_error)?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(page_count * page_size)
    }
}

#[async_trait]
impl Maintenance for SqliteMaintenance {
    async fn vacuum(&self) -> Result<i64> {
        let before = self.db_size_bytes().await?;
        let pool = self.pool.current().await;
        sqlx::query("VACUUM")
            .execute(&pool)
            .await
            .map_err(map_sqlx_error)?;
        let after = self.db_size_bytes().await?;
        let reclaimed = (before - after).max(0);
        info!(reclaimed_bytes = reclaimed, "vacuum complete");
        Ok(reclaimed)
    }

    async fn gc_finished_jobs(&self, retention_days: i64) -> Result<i64> {
        let pool = self.pool.current().await;
        let cutoff = self.time_provider.now_millis() - retention_days * MILLIS_PER_DAY;

        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
        let doomed = format!(
            "SELECT job_id FROM jobs WHERE status IN ({TERMINAL_JOB_STATUSES}) AND updated_at < ?"
        );

        sqlx::query(&format!(
            "DELETE FROM tasks WHERE parent_job_id IN ({doomed})"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(&format!(
            "DELETE FROM stage_advance_locks WHERE job_id IN ({doomed})"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM jobs WHERE status IN ({TERMINAL_JOB_STATUSES}) AND updated_at < ?"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let count = deleted.rows_affected() as i64;
        info!(deleted_jobs = count, retention_days = retention_days, "finished-job GC complete");
        Ok(count)
    }

    async fn get_stats(&self) -> Result<MaintenanceStats> {
        let pool = self.pool.current().await;
        let (jobs_in_flight, jobs_finished): (i64, i64) = sqlx::query_as(&format!(
            "SELECT COALESCE(SUM(status NOT IN ({TERMINAL_JOB_STATUSES})), 0), \
                    COALESCE(SUM(status IN ({TERMINAL_JOB_STATUSES})), 0) \
             FROM jobs"
        ))
        .fetch_one(&pool)
        .await
        .map_err(map_sqlx_error)?;

        let tasks_processing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'PROCESSING'")
                .fetch_one(&pool)
                .await
                .map_err(map_sqlx_error)?;
        let tasks_checkpointed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks \
             WHERE checkpoint_phase > 0 AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .fetch_one(&pool)
        .await
        .map_err(map_sqlx_error)?;

        let queue_backlog: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_error)?;
        let dead_letter_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_messages")
                .fetch_one(&pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(MaintenanceStats {
            db_size_bytes: self.db_size_bytes().await?,
            jobs_in_flight,
            jobs_finished,
            tasks_processing,
            tasks_checkpointed,
            queue_backlog,
            dead_letter_count,
        })
    }
}
