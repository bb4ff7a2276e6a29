// Daemon Configuration
//
// Layered: built-in defaults -> optional geoflow.toml -> GEOFLOW_* env
// overrides (GEOFLOW_WORKER__MODE=short, GEOFLOW_DATABASE__URL=..., ...).

use std::collections::HashMap;

use config::{Config, Environment, File};
use geoflow_core::error::{EngineError, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite url or path; `~` is expanded.
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    pub job: String,
    pub task_short: String,
    pub task_long: String,
    /// Specialized queues pinned per task_type.
    #[serde(default)]
    pub specialized: HashMap<String, String>,
    pub short_lock_seconds: u64,
    pub long_lock_seconds: u64,
    pub short_max_delivery: u32,
    pub long_max_delivery: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Serverless-style: no checkpointing, no lock renewal.
    Short,
    /// Container worker: checkpoint-aware, renews locks, drains on SIGTERM.
    Long,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub mode: WorkerMode,
    /// Worker identity recorded on tasks (`executed_by_app`).
    pub app_id: String,
    /// Credential rotation cadence; 0 disables the pool-rebuild loop.
    pub token_refresh_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    #[serde(default)]
    pub long_queue_task_types: Vec<String>,
    pub size_threshold_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSettings {
    pub interval_hours: u64,
    pub retention_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub queues: QueueSettings,
    pub worker: WorkerSettings,
    pub router: RouterSettings,
    pub maintenance: MaintenanceSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .set_default("database.url", "~/.geoflow/engine.db")
            .and_then(|b| b.set_default("database.max_connections", 10_i64))
            .and_then(|b| b.set_default("queues.job", "jobs"))
            .and_then(|b| b.set_default("queues.task_short", "tasks-short"))
            .and_then(|b| b.set_default("queues.task_long", "tasks-long"))
            .and_then(|b| b.set_default("queues.short_lock_seconds", 60_i64))
            .and_then(|b| b.set_default("queues.long_lock_seconds", 300_i64))
            .and_then(|b| b.set_default("queues.short_max_delivery", 3_i64))
            .and_then(|b| b.set_default("queues.long_max_delivery", 8_i64))
            .and_then(|b| b.set_default("worker.mode", "long"))
            .and_then(|b| b.set_default("worker.app_id", "geoflow-engine"))
            .and_then(|b| b.set_default("worker.token_refresh_minutes", 45_i64))
            .and_then(|b| b.set_default("router.size_threshold_bytes", 32_i64 * 1024 * 1024))
            .and_then(|b| b.set_default("maintenance.interval_hours", 24_i64))
            .and_then(|b| b.set_default("maintenance.retention_days", 7_i64))
            .map_err(|e| EngineError::Config(e.to_string()))?;

        builder
            .add_source(File::with_name("geoflow").required(false))
            .add_source(Environment::with_prefix("GEOFLOW").separator("__"))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Database url with `~` expanded, prefixed for sqlx.
    pub fn database_url(&self) -> String {
        let expanded = shellexpand::tilde(&self.database.url).into_owned();
        if expanded.starts_with("sqlite:") {
            expanded
        } else {
            format!("sqlite://{expanded}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.queues.job, "jobs");
        assert_eq!(settings.worker.mode, WorkerMode::Long);
        assert_eq!(settings.queues.long_max_delivery, 8);
    }

    #[test]
    fn database_url_is_prefixed() {
        let mut settings = Settings::load().unwrap();
        settings.database.url = "/var/lib/geoflow/engine.db".to_string();
        assert_eq!(
            settings.database_url(),
            "sqlite:///var/lib/geoflow/engine.db"
        );
    }
}
