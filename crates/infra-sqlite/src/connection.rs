// SQLite Connection Pool Setup

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use geoflow_core::error::{EngineError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use tracing::info;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a SQLite connection pool with WAL mode and a busy timeout.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| EngineError::Database(e.to_string()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(DEFAULT_BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| EngineError::Database(e.to_string()))?;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .map_err(|e| EngineError::Database(e.to_string()))?;

    Ok(pool)
}

/// Shared handle to the current pool.
///
/// Adapters read the pool through this handle on every call, so a rebuild
/// (credential rotation in long-running workers) swaps the pool underneath
/// them: new calls land on the fresh pool, and closing the old one waits
/// for outstanding borrows to return before severing connections.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<RwLock<SqlitePool>>,
}

impl PoolHandle {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(pool)),
        }
    }

    pub async fn current(&self) -> SqlitePool {
        self.inner.read().await.clone()
    }

    /// Drain-then-rebuild: swap in a fresh pool, then close the old one.
    pub async fn rebuild(&self, database_url: &str, max_connections: u32) -> Result<()> {
        let fresh = create_pool(database_url, max_connections).await?;
        let old = {
            let mut guard = self.inner.write().await;
            std::mem::replace(&mut *guard, fresh)
        };
        old.close().await;
        info!("connection pool rebuilt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool() {
        let pool = create_pool("sqlite::memory:", 1).await.unwrap();
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn rebuild_swaps_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("engine.db").display());

        let handle = PoolHandle::new(create_pool(&url, 2).await.unwrap());
        let before = handle.current().await;
        handle.rebuild(&url, 2).await.unwrap();
        let after = handle.current().await;

        assert!(before.is_closed());
        assert!(after.acquire().await.is_ok());
    }
}
