// In-memory test doubles for the StateStore and MessageBroker ports.
//
// Used by unit tests in this crate and by downstream test harnesses; the
// SQLite adapters re-verify the same contracts against real storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    JobRecord, JobStatus, StageSummary, TaskRecord, TaskResult, TaskStatus,
};
use crate::error::{EngineError, Result};
use crate::port::{
    DeadLetteredMessage, DeliveredMessage, IdProvider, MessageBroker, StageCompletion, StateStore,
    TaskOutcome, TimeProvider,
};

/// Controllable clock.
pub struct FixedTimeProvider {
    now: AtomicI64,
}

impl FixedTimeProvider {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeProvider for FixedTimeProvider {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Sequential id provider for deterministic correlation/message ids.
#[derive(Default)]
pub struct SeqIdProvider {
    counter: AtomicU64,
}

impl IdProvider for SeqIdProvider {
    fn generate_id(&self) -> String {
        format!("id-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<String, JobRecord>,
    tasks: HashMap<String, TaskRecord>,
}

/// In-memory StateStore honoring the transition matrices and the
/// advisory-locked completion check.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<StoreState>,
    // Serializes the completion-check critical section like the advisory lock
    completion_lock: tokio::sync::Mutex<()>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.tasks.get(task_id).map(|t| t.status))
    }

    pub fn task_count_for_stage(&self, job_id: &str, stage: u32) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.tasks
                    .values()
                    .filter(|t| t.parent_job_id == job_id && t.stage == stage)
                    .count()
            })
            .unwrap_or(0)
    }
}

fn task_result_of(task: &TaskRecord) -> TaskResult {
    TaskResult {
        task_id: task.task_id.clone(),
        task_index: task.task_index,
        task_type: task.task_type.clone(),
        success: task.status == TaskStatus::Completed,
        result: task.result_data.clone(),
        error: task.error_details.clone(),
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&job.job_id) {
            return Err(EngineError::AlreadyExists(job.job_id.clone()));
        }
        state.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.state.lock().unwrap().jobs.get(job_id).cloned())
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
        if job.status == status {
            return Ok(());
        }
        if !job.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition(format!(
                "job {job_id}: {} -> {status}",
                job.status
            )));
        }
        job.status = status;
        Ok(())
    }

    async fn update_job_stage(&self, job_id: &str, stage: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
        job.stage = job.stage.max(stage);
        Ok(())
    }

    async fn set_stage_result(
        &self,
        job_id: &str,
        stage: u32,
        summary: &StageSummary,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
        job.stage_results.insert(stage, summary.clone());
        Ok(())
    }

    async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: Option<&serde_json::Value>,
        error_details: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
        if job.status.is_terminal() {
            if job.status == status {
                return Ok(());
            }
            return Err(EngineError::InvalidTransition(format!(
                "job {job_id} already terminal: {}",
                job.status
            )));
        }
        job.status = status;
        job.result_data = result_data.cloned();
        job.error_details = error_details.map(str::to_string);
        Ok(())
    }

    async fn upsert_task(&self, task: &TaskRecord) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.tasks.contains_key(&task.task_id) {
            return Ok(false);
        }
        state.tasks.insert(task.task_id.clone(), task.clone());
        Ok(true)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.state.lock().unwrap().tasks.get(task_id).cloned())
    }

    async fn mark_task_processing(
        &self,
        task_id: &str,
        started_at: i64,
        executed_by: &str,
        retry_count: i32,
    ) -> Result<TaskRecord> {
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
        if !task.status.can_transition_to(TaskStatus::Processing) {
            return Err(EngineError::InvalidTransition(format!(
                "task {task_id}: {} -> PROCESSING",
                task.status
            )));
        }
        task.status = TaskStatus::Processing;
        task.execution_started_at.get_or_insert(started_at);
        task.executed_by_app = Some(executed_by.to_string());
        task.retry_count = retry_count;
        task.updated_at = started_at;
        Ok(task.clone())
    }

    async fn update_task_checkpoint(
        &self,
        task_id: &str,
        phase: u32,
        payload: &serde_json::Value,
        updated_at: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
        if task.status.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "task {task_id} is terminal, checkpoint rejected"
            )));
        }
        if phase < task.checkpoint_phase {
            return Err(EngineError::InvalidTransition(format!(
                "task {task_id}: checkpoint phase {} -> {phase}",
                task.checkpoint_phase
            )));
        }
        task.checkpoint_phase = phase;
        task.checkpoint_data = Some(payload.clone());
        task.checkpoint_updated_at = Some(updated_at);
        task.updated_at = updated_at;
        Ok(())
    }

    async fn touch_task(&self, task_id: &str, updated_at: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.updated_at = updated_at;
        }
        Ok(())
    }

    async fn list_tasks(&self, job_id: &str) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.stage, t.task_index));
        Ok(tasks)
    }

    async fn get_completed_tasks_for_stage(
        &self,
        job_id: &str,
        stage: u32,
    ) -> Result<Vec<TaskResult>> {
        let state = self.state.lock().unwrap();
        let mut results: Vec<TaskResult> = state
            .tasks
            .values()
            .filter(|t| {
                t.parent_job_id == job_id && t.stage == stage && t.status == TaskStatus::Completed
            })
            .map(task_result_of)
            .collect();
        results.sort_by_key(|t| t.task_index);
        Ok(results)
    }

    async fn get_failed_tasks(&self, job_id: &str) -> Result<Vec<TaskResult>> {
        let state = self.state.lock().unwrap();
        let mut results: Vec<(u32, TaskResult)> = state
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id && t.status == TaskStatus::Failed)
            .map(|t| (t.stage, task_result_of(t)))
            .collect();
        results.sort_by_key(|(stage, t)| (*stage, t.task_index));
        Ok(results.into_iter().map(|(_, t)| t).collect())
    }

    async fn complete_task_and_check_stage(
        &self,
        task_id: &str,
        job_id: &str,
        stage: u32,
        outcome: &TaskOutcome,
    ) -> Result<StageCompletion> {
        let _guard = self.completion_lock.lock().await;
        let mut state = self.state.lock().unwrap();

        let transitioned = {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
            if task.status.is_terminal() {
                // Duplicate completion: no effect, the earlier call counted
                false
            } else {
                task.status = outcome.status;
                task.result_data = outcome.result_data.clone();
                task.error_details = outcome.error_details.clone();
                true
            }
        };

        let mut total = 0;
        let mut succeeded = 0;
        let mut failed = 0;
        let mut remaining = 0;
        for task in state
            .tasks
            .values()
            .filter(|t| t.parent_job_id == job_id && t.stage == stage)
        {
            total += 1;
            match task.status {
                TaskStatus::Completed => succeeded += 1,
                TaskStatus::Failed => failed += 1,
                _ => remaining += 1,
            }
        }

        Ok(StageCompletion {
            stage_complete: transitioned && remaining == 0,
            total,
            succeeded,
            failed,
        })
    }
}

struct StoredMessage {
    message_id: String,
    body: serde_json::Value,
    delivery_count: u32,
    locked_until: Option<i64>,
    lock_token: Option<String>,
    seq: u64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Vec<StoredMessage>>,
    dead_letters: Vec<DeadLetteredMessage>,
    seq: u64,
    ids: u64,
}

/// In-memory MessageBroker with visibility-timeout claims, delivery
/// counting and a dead-letter queue.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    time: Arc<dyn TimeProvider>,
    lock_duration: Duration,
    max_delivery_count: u32,
}

impl MemoryBroker {
    pub fn new(time: Arc<dyn TimeProvider>, lock_duration: Duration, max_delivery_count: u32) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            time,
            lock_duration,
            max_delivery_count,
        }
    }

    /// Messages currently in the queue (locked or not).
    pub fn pending_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.queues.get(queue).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().map(|s| s.dead_letters.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn send(&self, queue: &str, body: &serde_json::Value) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.ids += 1;
        state.seq += 1;
        let message_id = format!("msg-{}", state.ids);
        let seq = state.seq;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push(StoredMessage {
                message_id: message_id.clone(),
                body: body.clone(),
                delivery_count: 0,
                locked_until: None,
                lock_token: None,
                seq,
            });
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        _wait: Duration,
    ) -> Result<Vec<DeliveredMessage>> {
        let now = self.time.now_millis();
        let locked_until = now + self.lock_duration.as_millis() as i64;
        let mut state = self.state.lock().unwrap();
        let max_delivery = self.max_delivery_count;

        let mut delivered = Vec::new();
        let mut expired = Vec::new();
        let BrokerState {
            queues,
            dead_letters,
            ids,
            ..
        } = &mut *state;
        if let Some(messages) = queues.get_mut(queue) {
            messages.sort_by_key(|m| m.seq);
            for msg in messages.iter_mut() {
                if delivered.len() as u32 >= max_messages {
                    break;
                }
                let available = msg.locked_until.map(|t| t <= now).unwrap_or(true);
                if !available {
                    continue;
                }
                if msg.delivery_count + 1 > max_delivery {
                    expired.push(msg.message_id.clone());
                    dead_letters.push(DeadLetteredMessage {
                        message_id: msg.message_id.clone(),
                        queue: queue.to_string(),
                        body: msg.body.clone(),
                        delivery_count: msg.delivery_count,
                        reason: "max delivery count exceeded".to_string(),
                        dead_lettered_at: now,
                    });
                    continue;
                }
                msg.delivery_count += 1;
                *ids += 1;
                let token = format!("lock-{ids}");
                msg.locked_until = Some(locked_until);
                msg.lock_token = Some(token.clone());
                delivered.push(DeliveredMessage {
                    message_id: msg.message_id.clone(),
                    queue: queue.to_string(),
                    body: msg.body.clone(),
                    delivery_count: msg.delivery_count,
                    lock_token: token,
                    locked_until,
                });
            }
            messages.retain(|m| !expired.contains(&m.message_id));
        }
        Ok(delivered)
    }

    async fn complete(&self, msg: &DeliveredMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let messages = state
            .queues
            .get_mut(&msg.queue)
            .ok_or_else(|| EngineError::LockLost(msg.message_id.clone()))?;
        let before = messages.len();
        messages.retain(|m| {
            !(m.message_id == msg.message_id && m.lock_token.as_deref() == Some(&msg.lock_token))
        });
        if messages.len() == before {
            return Err(EngineError::LockLost(msg.message_id.clone()));
        }
        Ok(())
    }

    async fn abandon(&self, msg: &DeliveredMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .queues
            .get_mut(&msg.queue)
            .and_then(|messages| {
                messages.iter_mut().find(|m| {
                    m.message_id == msg.message_id
                        && m.lock_token.as_deref() == Some(&msg.lock_token)
                })
            })
            .ok_or_else(|| EngineError::LockLost(msg.message_id.clone()))?;
        stored.locked_until = None;
        stored.lock_token = None;
        Ok(())
    }

    async fn dead_letter(&self, msg: &DeliveredMessage, reason: &str) -> Result<()> {
        let now = self.time.now_millis();
        let mut state = self.state.lock().unwrap();
        let BrokerState {
            queues,
            dead_letters,
            ..
        } = &mut *state;
        let messages = queues
            .get_mut(&msg.queue)
            .ok_or_else(|| EngineError::LockLost(msg.message_id.clone()))?;
        let index = messages
            .iter()
            .position(|m| {
                m.message_id == msg.message_id && m.lock_token.as_deref() == Some(&msg.lock_token)
            })
            .ok_or_else(|| EngineError::LockLost(msg.message_id.clone()))?;
        let stored = messages.remove(index);
        dead_letters.push(DeadLetteredMessage {
            message_id: stored.message_id,
            queue: msg.queue.clone(),
            body: stored.body,
            delivery_count: stored.delivery_count,
            reason: reason.to_string(),
            dead_lettered_at: now,
        });
        Ok(())
    }

    async fn renew_lock(&self, msg: &DeliveredMessage, duration: Duration) -> Result<i64> {
        let now = self.time.now_millis();
        let locked_until = now + duration.as_millis() as i64;
        let mut state = self.state.lock().unwrap();
        let stored = state
            .queues
            .get_mut(&msg.queue)
            .and_then(|messages| {
                messages.iter_mut().find(|m| {
                    m.message_id == msg.message_id
                        && m.lock_token.as_deref() == Some(&msg.lock_token)
                })
            })
            .ok_or_else(|| EngineError::LockLost(msg.message_id.clone()))?;
        stored.locked_until = Some(locked_until);
        Ok(locked_until)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetteredMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .dead_letters
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect())
    }
}
