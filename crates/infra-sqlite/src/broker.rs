// SQLite MessageBroker Implementation
//
// Durable named queues in the engine database: claims take a visibility
// lock (lock_token + locked_until), competing consumers race on a single
// atomic UPDATE, and messages past their delivery budget move to the
// dead-letter table at claim time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geoflow_core::error::{EngineError, Result};
use geoflow_core::port::{
    DeadLetteredMessage, DeliveredMessage, IdProvider, MessageBroker, TimeProvider,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::connection::PoolHandle;
use crate::state_store::map_sqlx_error;

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-queue delivery options.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 3,
        }
    }
}

/// Broker configuration: defaults plus per-queue overrides.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub default_options: QueueOptions,
    pub per_queue: HashMap<String, QueueOptions>,
}

impl BrokerConfig {
    pub fn options_for(&self, queue: &str) -> &QueueOptions {
        self.per_queue.get(queue).unwrap_or(&self.default_options)
    }

    pub fn with_queue(mut self, queue: impl Into<String>, options: QueueOptions) -> Self {
        self.per_queue.insert(queue.into(), options);
        self
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    message_id: String,
    queue: String,
    body: String,
    delivery_count: i64,
    lock_token: Option<String>,
    locked_until: Option<i64>,
}

pub struct SqliteMessageBroker {
    pool: PoolHandle,
    time_provider: Arc<dyn TimeProvider>,
    id_provider: Arc<dyn IdProvider>,
    config: BrokerConfig,
}

impl SqliteMessageBroker {
    pub fn new(
        pool: PoolHandle,
        time_provider: Arc<dyn TimeProvider>,
        id_provider: Arc<dyn IdProvider>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            pool,
            time_provider,
            id_provider,
            config,
        }
    }

    /// One claim attempt: lock up to `max_messages` available messages and
    /// dead-letter any that are past their delivery budget.
    async fn claim(&self, queue: &str, max_messages: u32) -> Result<Vec<DeliveredMessage>> {
        let pool = self.pool.current().await;
        let options = self.config.options_for(queue);
        let now = self.time_provider.now_millis();
        let locked_until = now + options.lock_duration.as_millis() as i64;
        let token = self.id_provider.generate_id();

        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE queue_messages
            SET delivery_count = delivery_count + 1,
                lock_token = ?,
                locked_until = ?
            WHERE message_id IN (
                SELECT message_id FROM queue_messages
                WHERE queue = ? AND (locked_until IS NULL OR locked_until <= ?)
                ORDER BY enqueued_at ASC, rowid ASC
                LIMIT ?
            )
            RETURNING message_id, queue, body, delivery_count, lock_token, locked_until
            "#,
        )
        .bind(&token)
        .bind(locked_until)
        .bind(queue)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut delivered = Vec::with_capacity(rows.len());
        for row in rows {
            if row.delivery_count as u32 > options.max_delivery_count {
                warn!(
                    message_id = %row.message_id,
                    queue = %queue,
                    delivery_count = row.delivery_count,
                    "delivery budget exhausted, dead-lettering"
                );
                self.move_to_dead_letter_queue(&row, "max delivery count exceeded")
                    .await?;
                continue;
            }
            delivered.push(DeliveredMessage {
                message_id: row.message_id,
                queue: row.queue,
                body: serde_json::from_str(&row.body)?,
                delivery_count: row.delivery_count as u32,
                lock_token: row.lock_token.unwrap_or_default(),
                locked_until: row.locked_until.unwrap_or(locked_until),
            });
        }
        Ok(delivered)
    }

    async fn move_to_dead_letter_queue(&self, row: &MessageRow, reason: &str) -> Result<()> {
        let pool = self.pool.current().await;
        let now = self.time_provider.now_millis();
        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_messages
                (message_id, queue, body, delivery_count, reason, dead_lettered_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.message_id)
        .bind(&row.queue)
        .bind(&row.body)
        // Count only completed deliveries, not the claim that tripped the cap
        .bind(row.delivery_count - 1)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM queue_messages WHERE message_id = ?")
            .bind(&row.message_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for SqliteMessageBroker {
    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<String> {
        let pool = self.pool.current().await;
        let message_id = self.id_provider.generate_id();
        let now = self.time_provider.now_millis();

        sqlx::query(
            r#"
            INSERT INTO queue_messages (message_id, queue, body, delivery_count, enqueued_at)
            VALUES (?, ?, ?, 0, ?)
            "#,
        )
        .bind(&message_id)
        .bind(queue)
        .bind(body.to_string())
        .bind(now)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!(queue = %queue, message_id = %message_id, "message sent");
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<DeliveredMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let claimed = self.claim(queue, max_messages).await?;
            if !claimed.is_empty() || Instant::now() >= deadline {
                return Ok(claimed);
            }
            sleep(CLAIM_POLL_INTERVAL.min(wait)).await;
        }
    }

    async fn complete(&self, msg: &DeliveredMessage) -> Result<()> {
        let pool = self.pool.current().await;
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE message_id = ? AND lock_token = ?",
        )
        .bind(&msg.message_id)
        .bind(&msg.lock_token)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::LockLost(msg.message_id.clone()));
        }
        Ok(())
    }

    async fn abandon(&self, msg: &DeliveredMessage) -> Result<()> {
        let pool = self.pool.current().await;
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET lock_token = NULL, locked_until = NULL
            WHERE message_id = ? AND lock_token = ?
            "#,
        )
        .bind(&msg.message_id)
        .bind(&msg.lock_token)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::LockLost(msg.message_id.clone()));
        }
        debug!(message_id = %msg.message_id, "message abandoned");
        Ok(())
    }

    async fn dead_letter(&self, msg: &DeliveredMessage, reason: &str) -> Result<()> {
        let pool = self.pool.current().await;
        let now = self.time_provider.now_millis();
        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT message_id, queue, body, delivery_count, lock_token, locked_until
            FROM queue_messages
            WHERE message_id = ? AND lock_token = ?
            "#,
        )
        .bind(&msg.message_id)
        .bind(&msg.lock_token)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| EngineError::LockLost(msg.message_id.clone()))?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_messages
                (message_id, queue, body, delivery_count, reason, dead_lettered_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.message_id)
        .bind(&row.queue)
        .bind(&row.body)
        .bind(row.delivery_count)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM queue_messages WHERE message_id = ?")
            .bind(&row.message_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        warn!(message_id = %msg.message_id, reason = %reason, "message dead-lettered");
        Ok(())
    }

    async fn renew_lock(&self, msg: &DeliveredMessage, duration: Duration) -> Result<i64> {
        let pool = self.pool.current().await;
        let now = self.time_provider.now_millis();
        let locked_until = now + duration.as_millis() as i64;

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET locked_until = ?
            WHERE message_id = ? AND lock_token = ?
            "#,
        )
        .bind(locked_until)
        .bind(&msg.message_id)
        .bind(&msg.lock_token)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::LockLost(msg.message_id.clone()));
        }
        Ok(locked_until)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetteredMessage>> {
        let pool = self.pool.current().await;
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT message_id, queue, body, delivery_count, reason, dead_lettered_at
            FROM dead_letter_messages
            WHERE queue = ?
            ORDER BY dead_lettered_at ASC
            "#,
        )
        .bind(queue)
        .fetch_all(&pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                Ok(DeadLetteredMessage {
                    message_id: row.message_id,
                    queue: row.queue,
                    body: serde_json::from_str(&row.body)?,
                    delivery_count: row.delivery_count as u32,
                    reason: row.reason,
                    dead_lettered_at: row.dead_lettered_at,
                })
            })
            .collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    message_id: String,
    queue: String,
    body: String,
    delivery_count: i64,
    reason: String,
    dead_lettered_at: i64,
}
