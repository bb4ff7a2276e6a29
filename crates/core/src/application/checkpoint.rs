// Checkpoint Manager - per-task phase progress for long-running handlers
//
// Checkpoint columns live on the task row but are written exclusively
// through this module. A handle is created per delivery from the freshly
// loaded task row, so resume decisions see the state the crashed worker
// left behind.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::error::DomainError;
use crate::domain::task::TaskRecord;
use crate::error::Result;
use crate::port::{StateStore, TimeProvider};

/// Verifies that a checkpointed phase's external output still exists before
/// resume is allowed to skip the phase. Re-queries the external collaborator
/// (blob store, catalog) that owns the artifact.
#[async_trait]
pub trait ArtifactValidator: Send + Sync {
    /// `checkpoint` is the last saved payload (Null when none was saved).
    async fn validate(&self, checkpoint: &serde_json::Value) -> bool;
}

struct CheckpointState {
    phase: u32,
    data: Option<serde_json::Value>,
}

/// Checkpoint view of one task, handed to long-running handlers.
pub struct CheckpointHandle {
    task_id: String,
    store: Arc<dyn StateStore>,
    time: Arc<dyn TimeProvider>,
    state: Mutex<CheckpointState>,
}

impl CheckpointHandle {
    /// Last completed phase (0 = none).
    pub fn phase(&self) -> u32 {
        self.state.lock().map(|s| s.phase).unwrap_or(0)
    }

    /// True iff `phase` has already been completed by an earlier delivery.
    pub fn should_skip(&self, phase: u32) -> bool {
        self.phase() >= phase
    }

    /// Like `should_skip`, but only skips when the validator confirms the
    /// phase's artifact still exists. A deleted artifact forces a re-run.
    pub async fn should_skip_validated(
        &self,
        phase: u32,
        validator: &dyn ArtifactValidator,
    ) -> bool {
        if !self.should_skip(phase) {
            return false;
        }
        let data = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.data.clone())
            .unwrap_or(serde_json::Value::Null);
        let valid = validator.validate(&data).await;
        if !valid {
            tracing::warn!(
                task_id = %self.task_id,
                phase = phase,
                "checkpointed artifact missing, re-running phase"
            );
        }
        valid
    }

    /// Persist a completed phase. Phase numbers are monotonic within a
    /// task's life; a regression is a handler bug.
    pub async fn save(&self, phase: u32, payload: serde_json::Value) -> Result<()> {
        let current = self.phase();
        if phase < current {
            return Err(DomainError::CheckpointRegression {
                current,
                requested: phase,
            }
            .into());
        }
        let now = self.time.now_millis();
        self.store
            .update_task_checkpoint(&self.task_id, phase, &payload, now)
            .await?;
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
            state.data = Some(payload);
        }
        tracing::debug!(task_id = %self.task_id, phase = phase, "checkpoint saved");
        Ok(())
    }

    /// Read a value from the last saved payload.
    pub fn get_data(&self, key: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.data.as_ref().and_then(|d| d.get(key).cloned()))
    }
}

/// Factory for checkpoint handles, wired once per worker process.
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    time: Arc<dyn TimeProvider>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn StateStore>, time: Arc<dyn TimeProvider>) -> Self {
        Self { store, time }
    }

    /// Build a handle seeded from the task row as loaded for this delivery.
    pub fn handle_for(&self, task: &TaskRecord) -> CheckpointHandle {
        CheckpointHandle {
            task_id: task.task_id.clone(),
            store: Arc::clone(&self.store),
            time: Arc::clone(&self.time),
            state: Mutex::new(CheckpointState {
                phase: task.checkpoint_phase,
                data: task.checkpoint_data.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::StateStore;
    use crate::testing::{FixedTimeProvider, MemoryStateStore};
    use serde_json::json;

    struct AlwaysMissing;

    #[async_trait]
    impl ArtifactValidator for AlwaysMissing {
        async fn validate(&self, _checkpoint: &serde_json::Value) -> bool {
            false
        }
    }

    struct AlwaysPresent;

    #[async_trait]
    impl ArtifactValidator for AlwaysPresent {
        async fn validate(&self, _checkpoint: &serde_json::Value) -> bool {
            true
        }
    }

    async fn seeded_handle() -> (Arc<MemoryStateStore>, CheckpointHandle) {
        let store = Arc::new(MemoryStateStore::new());
        let time = Arc::new(FixedTimeProvider::new(1_000));
        let task = TaskRecord::new(
            "t1", "j1", "echo", "echo_task", 1, 0,
            json!({}), "tasks-short", 1_000,
        );
        store.upsert_task(&task).await.unwrap();
        let manager = CheckpointManager::new(store.clone(), time);
        let handle = manager.handle_for(&task);
        (store, handle)
    }

    #[tokio::test]
    async fn save_advances_phase_and_persists() {
        let (store, handle) = seeded_handle().await;
        assert_eq!(handle.phase(), 0);
        assert!(!handle.should_skip(1));

        handle.save(1, json!({"cog_path": "silver/scene.tif"})).await.unwrap();
        assert!(handle.should_skip(1));
        assert!(!handle.should_skip(2));
        assert_eq!(handle.get_data("cog_path").unwrap(), "silver/scene.tif");

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.checkpoint_phase, 1);
    }

    #[tokio::test]
    async fn phase_regression_is_rejected() {
        let (_store, handle) = seeded_handle().await;
        handle.save(2, json!({})).await.unwrap();
        let err = handle.save(1, json!({})).await.unwrap_err();
        assert!(err.to_string().contains("regression"));
        assert_eq!(handle.phase(), 2);
    }

    #[tokio::test]
    async fn missing_artifact_forces_rerun() {
        let (_store, handle) = seeded_handle().await;
        handle.save(1, json!({"blob": "gone.tif"})).await.unwrap();

        assert!(handle.should_skip_validated(1, &AlwaysPresent).await);
        assert!(!handle.should_skip_validated(1, &AlwaysMissing).await);
        // An unreached phase never skips regardless of validation
        assert!(!handle.should_skip_validated(2, &AlwaysPresent).await);
    }
}
