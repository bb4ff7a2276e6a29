// Cooperative shutdown flag
//
// One clonable handle serves both sides: the daemon's signal handler
// triggers it, worker loops select on it between messages, and
// long-running handlers poll it between phases through their task
// context. There is no separate sender type; any clone can trigger.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Request shutdown. Idempotent; wakes every waiter.
    pub fn trigger(&self) {
        self.inner.send_replace(true);
    }

    /// True once shutdown has been requested.
    pub fn is_set(&self) -> bool {
        *self.inner.borrow()
    }

    /// Resolve once shutdown is requested; immediately if it already was.
    pub async fn wait(&self) {
        let mut rx = self.inner.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
