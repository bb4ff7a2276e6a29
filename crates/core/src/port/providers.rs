// Ambient providers: wall clock and opaque ids
//
// Job and task ids are content hashes (domain::identity); these ports
// cover everything non-deterministic the engine touches, so tests can pin
// both the clock and the generated correlation/message ids.

/// Epoch-millisecond clock.
pub trait TimeProvider: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Generator for correlation ids, broker message ids and lock tokens.
pub trait IdProvider: Send + Sync {
    fn generate_id(&self) -> String;
}

/// Production providers: the system clock and UUID v4.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
