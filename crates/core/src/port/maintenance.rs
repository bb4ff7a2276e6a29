// Store Maintenance port
//
// Retention GC and the health gauges an ETL operator watches: pipeline
// backlog, in-flight work, and resumable checkpointed tasks that would be
// lost if the store were wiped.

use async_trait::async_trait;

use crate::error::Result;

/// Operational snapshot of the engine store.
#[derive(Debug, Clone)]
pub struct MaintenanceStats {
    pub db_size_bytes: i64,
    /// Jobs still moving through their stages (QUEUED or PROCESSING).
    pub jobs_in_flight: i64,
    /// Jobs in a terminal state, awaiting retention GC.
    pub jobs_finished: i64,
    /// Tasks currently claimed by a worker.
    pub tasks_processing: i64,
    /// Non-terminal tasks carrying a checkpoint (interrupted long work
    /// waiting to be resumed).
    pub tasks_checkpointed: i64,
    /// Messages waiting in or locked on the queues.
    pub queue_backlog: i64,
    pub dead_letter_count: i64,
}

/// Maintenance configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Retention period for terminal jobs (days); their tasks go with them.
    pub finished_job_retention_days: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            finished_job_retention_days: 7,
        }
    }
}

/// Periodic store maintenance operations. Scheduling is the composition
/// root's concern; this port only knows how to do one pass.
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Reclaim space and optimize the store. Returns bytes reclaimed.
    async fn vacuum(&self) -> Result<i64>;

    /// Delete terminal jobs (and their tasks) older than the retention
    /// period. Returns the number of jobs deleted.
    async fn gc_finished_jobs(&self, retention_days: i64) -> Result<i64>;

    /// Get the current operational snapshot.
    async fn get_stats(&self) -> Result<MaintenanceStats>;

    /// One full maintenance pass (GC + VACUUM), reporting the state left
    /// behind.
    async fn run_full_maintenance(&self, config: &MaintenanceConfig) -> Result<MaintenanceStats> {
        self.gc_finished_jobs(config.finished_job_retention_days)
            .await?;
        self.vacuum().await?;
        self.get_stats().await
    }
}
