// Worker constants (no magic values inline)
use std::time::Duration;

/// Sleep duration when no messages are available (100ms)
pub const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(100);

/// Sleep duration after a worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Default lock duration for short task queues
pub const DEFAULT_SHORT_LOCK_DURATION: Duration = Duration::from_secs(60);

/// Default lock duration for long task queues
pub const DEFAULT_LONG_LOCK_DURATION: Duration = Duration::from_secs(300);

/// Default max delivery count for short queues
pub const DEFAULT_SHORT_MAX_DELIVERY: u32 = 3;

/// Default max delivery count for long queues; sized so a handful of
/// rolling-deploy interruptions never dead-letters a resumable task
pub const DEFAULT_LONG_MAX_DELIVERY: u32 = 8;

/// Hard cap on how long a single delivery's lock keeps being renewed (2h).
/// Past this the renewer stops and the lock is allowed to lapse.
pub const MAX_LOCK_RENEWAL_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

/// Minimum interval between lock renewals
pub const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(1);
