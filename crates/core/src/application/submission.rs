// Job Submission - validate, dedupe, create, enqueue stage 1

use std::sync::Arc;

use tracing::{debug, info};

use crate::application::registry::WorkflowRegistry;
use crate::domain::{identity, JobMessage, JobRecord, JobStatus};
use crate::error::{EngineError, Result};
use crate::port::{IdProvider, MessageBroker, StateStore, TimeProvider};

#[cfg(test)]
#[path = "submission_test.rs"]
mod submission_test;

/// What the submitter is told happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// New job row created and stage 1 enqueued.
    Created,
    /// A job with identical canonical parameters already reached a
    /// terminal state; the cached result is returned.
    AlreadyCompleted,
    /// A job with identical canonical parameters is still in flight.
    InProgress,
}

#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub job_id: String,
    pub status: SubmissionStatus,
    pub job_status: JobStatus,
    pub queue_name: String,
    /// Broker message id of the stage-1 dispatch; None unless Created.
    pub message_id: Option<String>,
    /// True when the submission matched an existing job.
    pub idempotent: bool,
    /// Populated only for AlreadyCompleted.
    pub result_data: Option<serde_json::Value>,
}

/// Idempotent submission front door. The deterministic job id makes a
/// resubmission with identical canonical parameters collide with the
/// existing row instead of spawning a duplicate pipeline.
pub struct SubmissionService {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn MessageBroker>,
    workflows: Arc<WorkflowRegistry>,
    job_queue: String,
    time: Arc<dyn TimeProvider>,
    ids: Arc<dyn IdProvider>,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn MessageBroker>,
        workflows: Arc<WorkflowRegistry>,
        job_queue: impl Into<String>,
        time: Arc<dyn TimeProvider>,
        ids: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            store,
            broker,
            workflows,
            job_queue: job_queue.into(),
            time,
            ids,
        }
    }

    pub async fn submit(
        &self,
        job_type: &str,
        parameters: &serde_json::Value,
    ) -> Result<SubmissionReceipt> {
        let workflow = self.workflows.get(job_type)?;
        let normalized = workflow.validate(parameters)?;
        let job_id = identity::job_id(job_type, &normalized);

        if let Some(existing) = self.store.get_job(&job_id).await? {
            return Ok(self.receipt_for_existing(existing));
        }

        let now = self.time.now_millis();
        let total_stages = workflow.stages().len() as u32;
        let job = JobRecord::new(job_id.clone(), job_type, normalized.clone(), total_stages, now);

        match self.store.create_job(&job).await {
            Ok(()) => {}
            Err(EngineError::AlreadyExists(_)) => {
                // Lost a submission race; the winner's row is authoritative
                debug!(job_id = %job_id, "concurrent submission collision");
                let existing = self.store.get_job(&job_id).await?.ok_or_else(|| {
                    EngineError::Internal(format!("job {job_id} vanished after collision"))
                })?;
                return Ok(self.receipt_for_existing(existing));
            }
            Err(e) => return Err(e),
        }

        let message = JobMessage {
            job_id: job_id.clone(),
            job_type: job_type.to_string(),
            stage: 1,
            parameters: normalized,
            correlation_id: self.ids.generate_id(),
        };
        let message_id = self
            .broker
            .send(&self.job_queue, &serde_json::to_value(&message)?)
            .await?;

        info!(job_id = %job_id, job_type = %job_type, "job submitted");
        Ok(SubmissionReceipt {
            job_id,
            status: SubmissionStatus::Created,
            job_status: JobStatus::Queued,
            queue_name: self.job_queue.clone(),
            message_id: Some(message_id),
            idempotent: false,
            result_data: None,
        })
    }

    pub async fn status(&self, job_id: &str) -> Result<JobRecord> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))
    }

    fn receipt_for_existing(&self, job: JobRecord) -> SubmissionReceipt {
        let (status, result_data) = if job.status.is_terminal() {
            (SubmissionStatus::AlreadyCompleted, job.result_data.clone())
        } else {
            (SubmissionStatus::InProgress, None)
        };
        SubmissionReceipt {
            job_id: job.job_id,
            status,
            job_status: job.status,
            queue_name: self.job_queue.clone(),
            message_id: None,
            idempotent: true,
            result_data,
        }
    }
}
