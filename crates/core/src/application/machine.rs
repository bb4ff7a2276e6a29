// CoreMachine - stateless orchestrator
//
// All durable state lives in the StateStore; the machine interprets
// job/task messages against it and tells the calling worker how to
// dispose of the broker message. Transient store/broker failures
// propagate as Err, which workers translate into an abandon so the
// message is redelivered.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::application::checkpoint::CheckpointManager;
use crate::application::handler::{HandlerResult, ProgressSink, TaskContext, TaskHandler};
use crate::application::registry::{HandlerRegistry, Workflow, WorkflowRegistry};
use crate::application::router::TaskRouter;
use crate::application::worker::ShutdownSignal;
use crate::domain::{
    identity, JobMessage, JobRecord, JobStatus, Parallelism, StageSummary, TaskMessage,
    TaskRecord, TaskResult, PREVIOUS_RESULTS_KEY,
};
use crate::error::{EngineError, Result};
use crate::port::{IdProvider, MessageBroker, StageCompletion, StateStore, TaskOutcome, TimeProvider};

#[cfg(test)]
#[path = "machine_test.rs"]
mod machine_test;

/// How the worker should dispose of the broker message it is holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Ack: terminal outcome reached (or idempotent no-op).
    Complete,
    /// Release for redelivery: retry, interruption, or transient failure.
    Abandon,
    /// Contract violation or poison message; park it with a reason.
    DeadLetter(String),
}

/// Delivery metadata the broker attached to the in-flight message.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryInfo {
    pub delivery_count: u32,
    pub max_delivery_count: u32,
}

impl DeliveryInfo {
    pub fn exhausted(&self) -> bool {
        self.delivery_count >= self.max_delivery_count
    }
}

/// Worker-supplied execution environment for task handlers.
///
/// Long-running workers provide checkpoints + shutdown; short-lived
/// workers provide neither.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub worker_id: String,
    pub checkpoints: Option<Arc<CheckpointManager>>,
    pub shutdown: Option<ShutdownSignal>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl ExecutionEnv {
    /// Serverless environment: no checkpoint, no shutdown awareness.
    pub fn short(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            checkpoints: None,
            shutdown: None,
            progress: None,
        }
    }

    /// Long-running container environment.
    pub fn long(
        worker_id: impl Into<String>,
        checkpoints: Arc<CheckpointManager>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            checkpoints: Some(checkpoints),
            shutdown: Some(shutdown),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }
}

pub struct CoreMachine {
    store: Arc<dyn StateStore>,
    broker: Arc<dyn MessageBroker>,
    workflows: Arc<WorkflowRegistry>,
    handlers: Arc<HandlerRegistry>,
    router: TaskRouter,
    job_queue: String,
    time: Arc<dyn TimeProvider>,
    ids: Arc<dyn IdProvider>,
}

impl CoreMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: Arc<dyn MessageBroker>,
        workflows: Arc<WorkflowRegistry>,
        handlers: Arc<HandlerRegistry>,
        router: TaskRouter,
        job_queue: impl Into<String>,
        time: Arc<dyn TimeProvider>,
        ids: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            store,
            broker,
            workflows,
            handlers,
            router,
            job_queue: job_queue.into(),
            time,
            ids,
        }
    }

    /// Handle one job-message: transition the job into the message's stage
    /// and dispatch that stage's tasks onto their routed queues.
    pub async fn process_job_message(&self, msg: &JobMessage) -> Result<Disposition> {
        let workflow = match self.workflows.get(&msg.job_type) {
            Ok(w) => w,
            Err(_) => {
                error!(job_type = %msg.job_type, "job message for unknown job type");
                return Ok(Disposition::DeadLetter(format!(
                    "unknown job type: {}",
                    msg.job_type
                )));
            }
        };

        let job = match self.store.get_job(&msg.job_id).await? {
            Some(job) => job,
            None => {
                error!(job_id = %msg.job_id, "job message without a job row");
                return Ok(Disposition::DeadLetter(format!(
                    "no job row for job_id {}",
                    msg.job_id
                )));
            }
        };

        if job.status.is_terminal() {
            // Replayed dispatch for a finished job
            debug!(job_id = %job.job_id, status = %job.status, "job already terminal, acking");
            return Ok(Disposition::Complete);
        }

        if msg.stage == 0 || msg.stage > job.total_stages {
            return Ok(Disposition::DeadLetter(format!(
                "stage {} out of range for job {} ({} stages)",
                msg.stage, job.job_id, job.total_stages
            )));
        }

        self.store
            .update_job_status(&msg.job_id, JobStatus::Processing)
            .await?;
        self.store.update_job_stage(&msg.job_id, msg.stage).await?;

        let previous_results = if msg.stage > 1 {
            self.store
                .get_completed_tasks_for_stage(&msg.job_id, msg.stage - 1)
                .await?
        } else {
            Vec::new()
        };

        let Some(stage_def) = workflow.stages().get(msg.stage as usize - 1) else {
            return Ok(Disposition::DeadLetter(format!(
                "stage {} out of range for job type {}",
                msg.stage, msg.job_type
            )));
        };

        let mut descriptors =
            match workflow.plan_stage(stage_def, &job.parameters, &previous_results) {
                Ok(d) => d,
                Err(e) => {
                    error!(job_id = %job.job_id, stage = msg.stage, error = %e, "stage planning failed");
                    return Ok(Disposition::DeadLetter(format!(
                        "stage planning failed: {e}"
                    )));
                }
            };

        match stage_def.parallelism {
            Parallelism::Single | Parallelism::FanIn if descriptors.len() != 1 => {
                return Ok(Disposition::DeadLetter(format!(
                    "{:?} stage {} produced {} tasks, expected exactly 1",
                    stage_def.parallelism,
                    msg.stage,
                    descriptors.len()
                )));
            }
            _ => {}
        }

        if stage_def.parallelism == Parallelism::FanIn {
            let params = &mut descriptors[0].parameters;
            if !params.is_object() {
                *params = serde_json::json!({});
            }
            if let Some(obj) = params.as_object_mut() {
                obj.insert(
                    PREVIOUS_RESULTS_KEY.to_string(),
                    serde_json::to_value(&previous_results)?,
                );
            }
        }

        if descriptors.is_empty() {
            // Empty fan_out: the stage is complete with no work performed
            info!(job_id = %job.job_id, stage = msg.stage, "stage produced no tasks, advancing");
            let completion = StageCompletion {
                stage_complete: true,
                total: 0,
                succeeded: 0,
                failed: 0,
            };
            self.handle_stage_complete(workflow.as_ref(), &job, msg.stage, &completion)
                .await?;
            return Ok(Disposition::Complete);
        }

        let now = self.time.now_millis();
        info!(
            job_id = %job.job_id,
            stage = msg.stage,
            stage_name = %stage_def.name,
            task_count = descriptors.len(),
            "dispatching stage"
        );

        for (index, descriptor) in descriptors.iter().enumerate() {
            let task_index = index as u32;
            let task_id =
                identity::task_id(&msg.job_id, msg.stage, &descriptor.task_type, task_index);
            let queue =
                self.router
                    .route(&descriptor.task_type, &descriptor.parameters, &job.parameters);

            let task = TaskRecord::new(
                task_id.clone(),
                msg.job_id.clone(),
                msg.job_type.clone(),
                descriptor.task_type.clone(),
                msg.stage,
                task_index,
                descriptor.parameters.clone(),
                queue.clone(),
                now,
            );
            let inserted = self.store.upsert_task(&task).await?;
            if !inserted {
                debug!(task_id = %task_id, "task row already exists, redispatch");
            }

            let task_message = TaskMessage {
                task_id,
                parent_job_id: msg.job_id.clone(),
                job_type: msg.job_type.clone(),
                task_type: descriptor.task_type.clone(),
                stage: msg.stage,
                task_index,
                parameters: descriptor.parameters.clone(),
                correlation_id: msg.correlation_id.clone(),
            };
            self.broker
                .send(&queue, &serde_json::to_value(&task_message)?)
                .await?;
        }

        Ok(Disposition::Complete)
    }

    /// Handle one task-message: run the handler and interpret its result,
    /// advancing the stage when this task turns out the lights.
    pub async fn process_task_message(
        &self,
        msg: &TaskMessage,
        delivery: DeliveryInfo,
        env: &ExecutionEnv,
    ) -> Result<Disposition> {
        let handler = match self.handlers.get(&msg.task_type) {
            Ok(h) => h,
            Err(_) => {
                error!(task_type = %msg.task_type, "task message for unknown task type");
                return Ok(Disposition::DeadLetter(format!(
                    "unknown task type: {}",
                    msg.task_type
                )));
            }
        };
        let workflow = match self.workflows.get(&msg.job_type) {
            Ok(w) => w,
            Err(_) => {
                return Ok(Disposition::DeadLetter(format!(
                    "unknown job type: {}",
                    msg.job_type
                )));
            }
        };

        let task = match self.store.get_task(&msg.task_id).await? {
            Some(task) => task,
            None => {
                error!(task_id = %msg.task_id, "task message without a task row");
                return Ok(Disposition::DeadLetter(format!(
                    "no task row for task_id {}",
                    msg.task_id
                )));
            }
        };

        if task.status.is_terminal() {
            // At-least-once redelivery of finished work
            info!(task_id = %task.task_id, status = %task.status, "task already terminal, acking");
            return Ok(Disposition::Complete);
        }

        let now = self.time.now_millis();
        let retry_count = delivery.delivery_count.saturating_sub(1) as i32;
        let task = self
            .store
            .mark_task_processing(&msg.task_id, now, &env.worker_id, retry_count)
            .await?;

        let ctx = self.build_context(&task, env);
        let result = self
            .invoke_handler(handler, task.parameters.clone(), ctx)
            .await;

        if result.success && result.interrupted {
            // Checkpointed work in flight: the task stays non-terminal and
            // the message MUST be abandoned so another worker resumes it.
            info!(
                task_id = %task.task_id,
                phase_completed = ?result.phase_completed,
                "handler interrupted by shutdown, abandoning for resume"
            );
            return Ok(Disposition::Abandon);
        }

        if result.success {
            let outcome = TaskOutcome::completed(result.result);
            let completion = self
                .store
                .complete_task_and_check_stage(&task.task_id, &msg.parent_job_id, msg.stage, &outcome)
                .await?;
            debug!(
                task_id = %task.task_id,
                stage_complete = completion.stage_complete,
                succeeded = completion.succeeded,
                failed = completion.failed,
                "task completed"
            );
            if completion.stage_complete {
                self.on_stage_complete(workflow.as_ref(), &msg.parent_job_id, msg.stage, &completion)
                    .await?;
            }
            return Ok(Disposition::Complete);
        }

        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "handler reported failure".to_string());

        if result.retryable && !delivery.exhausted() {
            warn!(
                task_id = %task.task_id,
                delivery_count = delivery.delivery_count,
                max_delivery_count = delivery.max_delivery_count,
                error = %error,
                "retryable task failure, abandoning for redelivery"
            );
            return Ok(Disposition::Abandon);
        }

        let detail = match &result.error_code {
            Some(code) => format!("[{code}] {error}"),
            None => error.clone(),
        };
        warn!(
            task_id = %task.task_id,
            retryable = result.retryable,
            delivery_count = delivery.delivery_count,
            error = %detail,
            "task failed permanently"
        );
        let outcome = TaskOutcome::failed(detail);
        let completion = self
            .store
            .complete_task_and_check_stage(&task.task_id, &msg.parent_job_id, msg.stage, &outcome)
            .await?;
        if completion.stage_complete {
            self.on_stage_complete(workflow.as_ref(), &msg.parent_job_id, msg.stage, &completion)
                .await?;
        }
        Ok(Disposition::Complete)
    }

    fn build_context(&self, task: &TaskRecord, env: &ExecutionEnv) -> TaskContext {
        let mut ctx = match (&env.checkpoints, &env.shutdown) {
            (Some(checkpoints), Some(shutdown)) => TaskContext::long(
                task.task_id.clone(),
                task.parent_job_id.clone(),
                Arc::new(checkpoints.handle_for(task)),
                shutdown.clone(),
            ),
            _ => TaskContext::short(task.task_id.clone(), task.parent_job_id.clone()),
        };
        if let Some(progress) = &env.progress {
            ctx = ctx.with_progress(Arc::clone(progress));
        }
        ctx
    }

    /// Run the handler on its own task so a panic cannot take down the
    /// worker loop; a panic is a permanent handler failure.
    async fn invoke_handler(
        &self,
        handler: Arc<dyn TaskHandler>,
        parameters: serde_json::Value,
        ctx: TaskContext,
    ) -> HandlerResult {
        let handle =
            tokio::task::spawn(async move { handler.execute(&parameters, &ctx).await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                error!(error = ?join_err, "handler panicked");
                HandlerResult::permanent("handler panicked").with_error_code("HANDLER_PANIC")
            }
            Err(join_err) => {
                error!(error = ?join_err, "handler task cancelled");
                HandlerResult::permanent("handler task cancelled")
            }
        }
    }

    async fn on_stage_complete(
        &self,
        workflow: &dyn Workflow,
        job_id: &str,
        stage: u32,
        completion: &StageCompletion,
    ) -> Result<()> {
        let job = self.store.get_job(job_id).await?.ok_or_else(|| {
            EngineError::ContractViolation(format!("job row vanished for job_id {job_id}"))
        })?;
        self.handle_stage_complete(workflow, &job, stage, completion)
            .await
    }

    /// The stage-completion path, entered exactly once per (job, stage) by
    /// the completion-check winner (or directly on an empty fan_out).
    async fn handle_stage_complete(
        &self,
        workflow: &dyn Workflow,
        job: &JobRecord,
        stage: u32,
        completion: &StageCompletion,
    ) -> Result<()> {
        let summary = StageSummary {
            total: completion.total,
            succeeded: completion.succeeded,
            failed: completion.failed,
        };
        self.store
            .set_stage_result(&job.job_id, stage, &summary)
            .await?;

        info!(
            job_id = %job.job_id,
            stage = stage,
            total = completion.total,
            succeeded = completion.succeeded,
            failed = completion.failed,
            "stage complete"
        );

        if completion.failed > 0
            && workflow.failure_policy() == crate::domain::FailurePolicy::FailJob
        {
            let errors = self.aggregate_errors(&job.job_id).await?;
            self.store
                .finalize_job(&job.job_id, JobStatus::Failed, None, errors.as_deref())
                .await?;
            warn!(job_id = %job.job_id, stage = stage, "job failed by workflow policy");
            return Ok(());
        }

        if stage < job.total_stages {
            let next = JobMessage {
                job_id: job.job_id.clone(),
                job_type: job.job_type.clone(),
                stage: stage + 1,
                parameters: job.parameters.clone(),
                correlation_id: self.ids.generate_id(),
            };
            self.broker
                .send(&self.job_queue, &serde_json::to_value(&next)?)
                .await?;
            debug!(job_id = %job.job_id, next_stage = stage + 1, "next stage enqueued");
        } else {
            self.finalize_job(workflow, &job.job_id, stage).await?;
        }
        Ok(())
    }

    async fn finalize_job(
        &self,
        workflow: &dyn Workflow,
        job_id: &str,
        last_stage: u32,
    ) -> Result<()> {
        let final_results = self
            .store
            .get_completed_tasks_for_stage(job_id, last_stage)
            .await?;
        // Re-read so all stage summaries are visible for the failure count
        let job = self.store.get_job(job_id).await?.ok_or_else(|| {
            EngineError::ContractViolation(format!("job row vanished for job_id {job_id}"))
        })?;

        let result_data = match workflow.finalize(&job, &final_results).await? {
            Some(custom) => custom,
            None => default_result_data(&final_results),
        };

        let any_failed = job.total_failed_tasks() > 0;
        let (status, error_details) = if any_failed {
            (
                JobStatus::CompletedWithErrors,
                self.aggregate_errors(job_id).await?,
            )
        } else {
            (JobStatus::Completed, None)
        };

        self.store
            .finalize_job(job_id, status, Some(&result_data), error_details.as_deref())
            .await?;
        info!(job_id = %job_id, status = %status, "job finalized");
        Ok(())
    }

    async fn aggregate_errors(&self, job_id: &str) -> Result<Option<String>> {
        let failed = self.store.get_failed_tasks(job_id).await?;
        if failed.is_empty() {
            return Ok(None);
        }
        let lines: Vec<String> = failed
            .iter()
            .map(|t| {
                format!(
                    "stage task {} ({}): {}",
                    t.task_index,
                    t.task_type,
                    t.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        Ok(Some(lines.join("; ")))
    }
}

/// Default final aggregation when the workflow supplies no `finalize`:
/// a single trailing task's result as-is, otherwise the result list.
fn default_result_data(final_results: &[TaskResult]) -> serde_json::Value {
    match final_results {
        [only] => only.result.clone().unwrap_or(serde_json::Value::Null),
        many => serde_json::json!({
            "results": many
                .iter()
                .map(|t| t.result.clone().unwrap_or(serde_json::Value::Null))
                .collect::<Vec<_>>()
        }),
    }
}
