// MessageBroker Port (Interface)
//
// Named-queue abstraction with at-least-once delivery and competing
// consumers. Redelivery happens on abandon, lock expiry, or worker crash.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A message claimed from a queue, locked for this consumer until
/// `locked_until` (epoch ms) or until completed/abandoned.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message_id: String,
    pub queue: String,
    pub body: serde_json::Value,
    /// Number of deliveries including this one.
    pub delivery_count: u32,
    /// Exclusive claim token; broker operations on this delivery fail with
    /// `EngineError::LockLost` once another consumer holds the message.
    pub lock_token: String,
    pub locked_until: i64,
}

/// Message disposition and lock management across named queues.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Enqueue a message; returns the broker-assigned message id.
    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<String>;

    /// Claim up to `max_messages`, waiting up to `wait` for the first one.
    /// Messages past their max delivery count are dead-lettered instead of
    /// delivered.
    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<DeliveredMessage>>;

    /// Ack: remove the message from the queue.
    async fn complete(&self, msg: &DeliveredMessage) -> Result<()>;

    /// Release the lock for redelivery to the next consumer.
    async fn abandon(&self, msg: &DeliveredMessage) -> Result<()>;

    /// Move the message to the dead-letter queue.
    async fn dead_letter(&self, msg: &DeliveredMessage, reason: &str) -> Result<()>;

    /// Extend the visibility timeout; returns the new `locked_until`.
    async fn renew_lock(&self, msg: &DeliveredMessage, duration: Duration) -> Result<i64>;

    /// Dead-lettered messages of a queue (operator surface).
    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetteredMessage>>;
}

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub message_id: String,
    pub queue: String,
    pub body: serde_json::Value,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_lettered_at: i64,
}
