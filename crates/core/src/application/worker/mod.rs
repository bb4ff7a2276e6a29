// Worker Loops - message consumption around the CoreMachine

pub mod constants;
mod renewal;
mod short;
mod shutdown;

pub use renewal::LockRenewalGuard;
pub use short::ShortLivedWorker;
pub use shutdown::ShutdownSignal;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::application::machine::{CoreMachine, DeliveryInfo, Disposition, ExecutionEnv};
use crate::domain::{JobMessage, TaskMessage};
use crate::error::Result;
use crate::port::{DeliveredMessage, MessageBroker};
use constants::{ERROR_RECOVERY_SLEEP_DURATION, IDLE_SLEEP_DURATION};

/// Which message shape a queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Jobs,
    Tasks,
}

/// Per-queue consumption options.
#[derive(Debug, Clone)]
pub struct QueueWorkerOptions {
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    /// Renew the message lock while the handler runs (long-running mode).
    pub renew_locks: bool,
    pub max_renewal_window: Duration,
}

impl QueueWorkerOptions {
    pub fn short() -> Self {
        Self {
            lock_duration: constants::DEFAULT_SHORT_LOCK_DURATION,
            max_delivery_count: constants::DEFAULT_SHORT_MAX_DELIVERY,
            renew_locks: false,
            max_renewal_window: constants::MAX_LOCK_RENEWAL_WINDOW,
        }
    }

    pub fn long() -> Self {
        Self {
            lock_duration: constants::DEFAULT_LONG_LOCK_DURATION,
            max_delivery_count: constants::DEFAULT_LONG_MAX_DELIVERY,
            renew_locks: true,
            max_renewal_window: constants::MAX_LOCK_RENEWAL_WINDOW,
        }
    }
}

/// Long-running polling worker: competing consumer on one queue, one
/// message in flight per worker, graceful shutdown between messages.
pub struct QueueWorker {
    queue: String,
    kind: QueueKind,
    broker: Arc<dyn MessageBroker>,
    machine: Arc<CoreMachine>,
    env: ExecutionEnv,
    options: QueueWorkerOptions,
}

impl QueueWorker {
    pub fn new(
        queue: impl Into<String>,
        kind: QueueKind,
        broker: Arc<dyn MessageBroker>,
        machine: Arc<CoreMachine>,
        env: ExecutionEnv,
        options: QueueWorkerOptions,
    ) -> Self {
        Self {
            queue: queue.into(),
            kind,
            broker,
            machine,
            env,
            options,
        }
    }

    /// Run the consumption loop until shutdown is signalled. In-flight
    /// handlers observe the same signal through their task context and
    /// return interrupted; the message is then abandoned for resume.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        info!(queue = %self.queue, kind = ?self.kind, "worker started");
        loop {
            if shutdown.is_set() {
                info!(queue = %self.queue, "worker shutting down");
                break;
            }
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = sleep(IDLE_SLEEP_DURATION) => {}
                        _ = shutdown.wait() => {
                            info!(queue = %self.queue, "worker interrupted during idle");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "worker receive error");
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {}
                        _ = shutdown.wait() => {
                            info!(queue = %self.queue, "worker interrupted during error recovery");
                            break;
                        }
                    }
                }
            }
        }
        info!(queue = %self.queue, "worker stopped");
        Ok(())
    }

    /// Receive and process at most one message. Returns true if one was
    /// handled.
    pub async fn poll_once(&self) -> Result<bool> {
        let delivered = self.broker.receive(&self.queue, 1, Duration::ZERO).await?;
        let Some(msg) = delivered.into_iter().next() else {
            return Ok(false);
        };
        self.handle_delivery(msg).await;
        Ok(true)
    }

    async fn handle_delivery(&self, msg: DeliveredMessage) {
        let _renewal = self.options.renew_locks.then(|| {
            LockRenewalGuard::spawn(
                Arc::clone(&self.broker),
                msg.clone(),
                self.options.lock_duration,
                self.options.max_renewal_window,
            )
        });

        let outcome = dispatch_message(
            &self.machine,
            self.kind,
            &msg,
            self.options.max_delivery_count,
            &self.env,
        )
        .await;

        apply_disposition(self.broker.as_ref(), &msg, outcome).await;
    }
}

/// Parse the message body and hand it to the machine.
pub(crate) async fn dispatch_message(
    machine: &CoreMachine,
    kind: QueueKind,
    msg: &DeliveredMessage,
    max_delivery_count: u32,
    env: &ExecutionEnv,
) -> Result<Disposition> {
    match kind {
        QueueKind::Jobs => match serde_json::from_value::<JobMessage>(msg.body.clone()) {
            Ok(job_msg) => machine.process_job_message(&job_msg).await,
            Err(e) => Ok(Disposition::DeadLetter(format!("malformed job message: {e}"))),
        },
        QueueKind::Tasks => match serde_json::from_value::<TaskMessage>(msg.body.clone()) {
            Ok(task_msg) => {
                let delivery = DeliveryInfo {
                    delivery_count: msg.delivery_count,
                    max_delivery_count,
                };
                machine.process_task_message(&task_msg, delivery, env).await
            }
            Err(e) => Ok(Disposition::DeadLetter(format!(
                "malformed task message: {e}"
            ))),
        },
    }
}

/// Apply the machine's verdict to the broker message. Transient machine
/// errors abandon the message so it is redelivered.
pub(crate) async fn apply_disposition(
    broker: &dyn MessageBroker,
    msg: &DeliveredMessage,
    outcome: Result<Disposition>,
) {
    let result = match outcome {
        Ok(Disposition::Complete) => broker.complete(msg).await,
        Ok(Disposition::Abandon) => broker.abandon(msg).await,
        Ok(Disposition::DeadLetter(reason)) => {
            warn!(message_id = %msg.message_id, reason = %reason, "dead-lettering message");
            broker.dead_letter(msg, &reason).await
        }
        Err(e) => {
            warn!(
                message_id = %msg.message_id,
                error = %e,
                "processing failed, abandoning for redelivery"
            );
            broker.abandon(msg).await
        }
    };
    if let Err(e) = result {
        // Lock lost or broker hiccup: the message will be redelivered and
        // idempotent task handling absorbs the duplicate.
        debug!(message_id = %msg.message_id, error = %e, "message disposition failed");
    }
}
