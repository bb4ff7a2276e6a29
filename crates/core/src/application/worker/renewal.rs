// Lock Renewal Guard
//
// While a long-running handler is in flight, a background task keeps the
// broker message's visibility lock alive. The guard stops renewing on
// drop; a capped renewal window bounds how long a wedged handler can hold
// a message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::application::worker::constants::MIN_RENEWAL_INTERVAL;
use crate::port::{DeliveredMessage, MessageBroker};

pub struct LockRenewalGuard {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl LockRenewalGuard {
    /// Renew `msg`'s lock every `lock_duration / 2` until dropped or until
    /// `max_window` has elapsed.
    pub fn spawn(
        broker: Arc<dyn MessageBroker>,
        msg: DeliveredMessage,
        lock_duration: Duration,
        max_window: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let interval = (lock_duration / 2).max(MIN_RENEWAL_INTERVAL);
        let deadline = Instant::now() + max_window;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
                if Instant::now() >= deadline {
                    warn!(
                        message_id = %msg.message_id,
                        "max lock renewal window reached, letting the lock lapse"
                    );
                    break;
                }
                match broker.renew_lock(&msg, lock_duration).await {
                    Ok(locked_until) => {
                        debug!(
                            message_id = %msg.message_id,
                            locked_until = locked_until,
                            "message lock renewed"
                        );
                    }
                    Err(e) => {
                        // Lock already lost; the message will be redelivered
                        warn!(message_id = %msg.message_id, error = %e, "lock renewal failed");
                        break;
                    }
                }
            }
        });

        Self { stop, handle }
    }
}

impl Drop for LockRenewalGuard {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MessageBroker;
    use crate::testing::{FixedTimeProvider, MemoryBroker};
    use serde_json::json;

    #[tokio::test]
    async fn guard_keeps_the_lock_alive_until_dropped() {
        let time = Arc::new(FixedTimeProvider::new(1_000));
        let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new(
            time.clone(),
            Duration::from_secs(2),
            5,
        ));

        broker.send("q", &json!({})).await.unwrap();
        let msg = broker
            .receive("q", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);

        let guard = LockRenewalGuard::spawn(
            broker.clone(),
            msg.clone(),
            Duration::from_secs(2),
            Duration::from_secs(60),
        );

        // Let the original lock lapse on the broker clock; the renewer
        // re-extends it from the new now
        time.advance(10_000);
        tokio::time::sleep(Duration::from_millis(1_300)).await;

        let competing = broker.receive("q", 1, Duration::ZERO).await.unwrap();
        assert!(competing.is_empty(), "renewed lock must block competitors");

        // Once the guard is gone the lock eventually lapses
        drop(guard);
        time.advance(10_000);
        let competing = broker.receive("q", 1, Duration::ZERO).await.unwrap();
        assert_eq!(competing.len(), 1);
    }
}
