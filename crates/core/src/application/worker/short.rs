// Short-lived Worker - single-invocation handler for serverless runtimes
//
// One invocation processes at most one message within the runtime's hard
// deadline. No checkpointing, no shutdown awareness: if the runtime kills
// the invocation, the broker lock expires and the message is redelivered.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::application::machine::{CoreMachine, ExecutionEnv};
use crate::application::worker::{apply_disposition, dispatch_message, QueueKind};
use crate::error::Result;
use crate::port::MessageBroker;

pub struct ShortLivedWorker {
    queue: String,
    kind: QueueKind,
    broker: Arc<dyn MessageBroker>,
    machine: Arc<CoreMachine>,
    env: ExecutionEnv,
    max_delivery_count: u32,
}

impl ShortLivedWorker {
    pub fn new(
        queue: impl Into<String>,
        kind: QueueKind,
        broker: Arc<dyn MessageBroker>,
        machine: Arc<CoreMachine>,
        worker_id: impl Into<String>,
        max_delivery_count: u32,
    ) -> Self {
        Self {
            queue: queue.into(),
            kind,
            broker,
            machine,
            env: ExecutionEnv::short(worker_id),
            max_delivery_count,
        }
    }

    /// Process at most one message, waiting up to `wait` for it to arrive.
    /// Returns true if a message was handled.
    pub async fn run_once(&self, wait: Duration) -> Result<bool> {
        let delivered = self.broker.receive(&self.queue, 1, wait).await?;
        let Some(msg) = delivered.into_iter().next() else {
            debug!(queue = %self.queue, "no message within wait window");
            return Ok(false);
        };

        let outcome = dispatch_message(
            &self.machine,
            self.kind,
            &msg,
            self.max_delivery_count,
            &self.env,
        )
        .await;
        apply_disposition(self.broker.as_ref(), &msg, outcome).await;
        Ok(true)
    }
}
