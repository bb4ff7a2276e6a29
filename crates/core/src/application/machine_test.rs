// CoreMachine unit tests against the in-memory port doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{CoreMachine, DeliveryInfo, Disposition, ExecutionEnv};
use crate::application::handler::{HandlerResult, TaskContext, TaskHandler};
use crate::application::registry::{HandlerRegistry, Workflow, WorkflowRegistry};
use crate::application::router::{RouterConfig, TaskRouter};
use crate::port::providers::TimeProvider;
use crate::domain::{
    FailurePolicy, JobMessage, JobRecord, JobStatus, Parallelism, StageDefinition, TaskDescriptor,
    TaskMessage, TaskResult, TaskStatus,
};
use crate::error::Result;
use crate::port::{MessageBroker, StateStore};
use crate::testing::{FixedTimeProvider, MemoryBroker, MemoryStateStore, SeqIdProvider};

const JOB_QUEUE: &str = "jobs";
const SHORT_QUEUE: &str = "tasks-short";

/// One-stage workflow whose single task carries the submission parameters.
struct SingleTaskWorkflow {
    job_type: &'static str,
    stages: Vec<StageDefinition>,
    policy: FailurePolicy,
}

impl SingleTaskWorkflow {
    fn new(job_type: &'static str, task_type: &'static str) -> Self {
        Self {
            job_type,
            stages: vec![StageDefinition::new(1, "run", task_type, Parallelism::Single)],
            policy: FailurePolicy::ContinueWithErrors,
        }
    }

    fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Workflow for SingleTaskWorkflow {
    fn job_type(&self) -> &str {
        self.job_type
    }

    fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    fn plan_stage(
        &self,
        stage: &StageDefinition,
        parameters: &serde_json::Value,
        _previous_results: &[TaskResult],
    ) -> Result<Vec<TaskDescriptor>> {
        Ok(vec![TaskDescriptor::new(
            stage.task_type.clone(),
            parameters.clone(),
        )])
    }
}

struct TwoStageWorkflow;

#[async_trait]
impl Workflow for TwoStageWorkflow {
    fn job_type(&self) -> &str {
        "two_stage"
    }

    fn stages(&self) -> &[StageDefinition] {
        static STAGES: std::sync::OnceLock<Vec<StageDefinition>> = std::sync::OnceLock::new();
        STAGES.get_or_init(|| {
            vec![
                StageDefinition::new(1, "prepare", "echo_task", Parallelism::Single),
                StageDefinition::new(2, "collect", "echo_task", Parallelism::FanIn),
            ]
        })
    }

    fn plan_stage(
        &self,
        _stage: &StageDefinition,
        parameters: &serde_json::Value,
        _previous_results: &[TaskResult],
    ) -> Result<Vec<TaskDescriptor>> {
        Ok(vec![TaskDescriptor::new("echo_task", parameters.clone())])
    }
}

struct EmptyFanOutWorkflow;

#[async_trait]
impl Workflow for EmptyFanOutWorkflow {
    fn job_type(&self) -> &str {
        "empty_fan_out"
    }

    fn stages(&self) -> &[StageDefinition] {
        static STAGES: std::sync::OnceLock<Vec<StageDefinition>> = std::sync::OnceLock::new();
        STAGES.get_or_init(|| {
            vec![StageDefinition::new(1, "scatter", "echo_task", Parallelism::FanOut)]
        })
    }

    fn plan_stage(
        &self,
        _stage: &StageDefinition,
        _parameters: &serde_json::Value,
        _previous_results: &[TaskResult],
    ) -> Result<Vec<TaskDescriptor>> {
        Ok(Vec::new())
    }
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        HandlerResult::ok(parameters.clone())
    }
}

struct RetryableHandler;

#[async_trait]
impl TaskHandler for RetryableHandler {
    async fn execute(&self, _parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        HandlerResult::retryable("connection reset")
    }
}

struct PermanentFailHandler;

#[async_trait]
impl TaskHandler for PermanentFailHandler {
    async fn execute(&self, _parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        HandlerResult::permanent("source blob missing").with_error_code("SOURCE_NOT_FOUND")
    }
}

struct PanickingHandler;

#[async_trait]
impl TaskHandler for PanickingHandler {
    async fn execute(&self, _parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        panic!("handler blew up");
    }
}

struct InterruptedHandler;

#[async_trait]
impl TaskHandler for InterruptedHandler {
    async fn execute(&self, _parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        HandlerResult::interrupted(1)
    }
}

struct Fixture {
    machine: CoreMachine,
    store: Arc<MemoryStateStore>,
    broker: Arc<MemoryBroker>,
    time: Arc<FixedTimeProvider>,
}

fn fixture() -> Fixture {
    let time = Arc::new(FixedTimeProvider::new(1_000));
    let store = Arc::new(MemoryStateStore::new());
    let broker = Arc::new(MemoryBroker::new(
        time.clone(),
        Duration::from_secs(60),
        3,
    ));

    let mut workflows = WorkflowRegistry::new();
    workflows.register(Arc::new(SingleTaskWorkflow::new("echo", "echo_task")));
    workflows.register(Arc::new(SingleTaskWorkflow::new("retry_flow", "retryable_task")));
    workflows.register(Arc::new(SingleTaskWorkflow::new(
        "interrupt_flow",
        "interrupted_task",
    )));
    workflows.register(Arc::new(
        SingleTaskWorkflow::new("strict_flow", "failing_task")
            .with_policy(FailurePolicy::FailJob),
    ));
    workflows.register(Arc::new(SingleTaskWorkflow::new("panic_flow", "panicking_task")));
    workflows.register(Arc::new(TwoStageWorkflow));
    workflows.register(Arc::new(EmptyFanOutWorkflow));

    let mut handlers = HandlerRegistry::new();
    handlers.register("echo_task", Arc::new(EchoHandler));
    handlers.register("retryable_task", Arc::new(RetryableHandler));
    handlers.register("interrupted_task", Arc::new(InterruptedHandler));
    handlers.register("failing_task", Arc::new(PermanentFailHandler));
    handlers.register("panicking_task", Arc::new(PanickingHandler));

    let machine = CoreMachine::new(
        store.clone(),
        broker.clone(),
        Arc::new(workflows),
        Arc::new(handlers),
        TaskRouter::new(RouterConfig::default()),
        JOB_QUEUE,
        time.clone(),
        Arc::new(SeqIdProvider::default()),
    );

    Fixture {
        machine,
        store,
        broker,
        time,
    }
}

fn job_message(job_id: &str, job_type: &str, stage: u32, parameters: serde_json::Value) -> JobMessage {
    JobMessage {
        job_id: job_id.into(),
        job_type: job_type.into(),
        stage,
        parameters,
        correlation_id: "corr-1".into(),
    }
}

async fn seed_job(f: &Fixture, job_id: &str, job_type: &str, total_stages: u32, params: serde_json::Value) {
    let job = JobRecord::new(job_id, job_type, params, total_stages, f.time.now_millis());
    f.store.create_job(&job).await.unwrap();
}

async fn next_task_message(f: &Fixture) -> (TaskMessage, DeliveryInfo) {
    let delivered = f
        .broker
        .receive(SHORT_QUEUE, 1, Duration::ZERO)
        .await
        .unwrap();
    let msg = delivered.into_iter().next().expect("task message expected");
    let task: TaskMessage = serde_json::from_value(msg.body.clone()).unwrap();
    (
        task,
        DeliveryInfo {
            delivery_count: msg.delivery_count,
            max_delivery_count: 3,
        },
    )
}

#[tokio::test]
async fn single_stage_job_runs_to_completed() {
    let f = fixture();
    seed_job(&f, "job-1", "echo", 1, json!({"msg": "hi"})).await;

    let disposition = f
        .machine
        .process_job_message(&job_message("job-1", "echo", 1, json!({"msg": "hi"})))
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Complete);
    assert_eq!(f.store.task_count_for_stage("job-1", 1), 1);

    let (task_msg, delivery) = next_task_message(&f).await;
    let disposition = f
        .machine
        .process_task_message(&task_msg, delivery, &ExecutionEnv::short("test-worker"))
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Complete);

    let job = f.store.get_job("job-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data.unwrap()["msg"], "hi");
    let summary = &job.stage_results[&1];
    assert_eq!((summary.total, summary.succeeded, summary.failed), (1, 1, 0));
}

#[tokio::test]
async fn unknown_job_type_is_dead_lettered() {
    let f = fixture();
    let disposition = f
        .machine
        .process_job_message(&job_message("job-x", "nope", 1, json!({})))
        .await
        .unwrap();
    assert!(matches!(disposition, Disposition::DeadLetter(_)));
}

#[tokio::test]
async fn missing_job_row_is_dead_lettered() {
    let f = fixture();
    let disposition = f
        .machine
        .process_job_message(&job_message("job-ghost", "echo", 1, json!({})))
        .await
        .unwrap();
    assert!(matches!(disposition, Disposition::DeadLetter(_)));
}

#[tokio::test]
async fn interrupted_handler_is_abandoned_and_task_stays_open() {
    let f = fixture();
    seed_job(&f, "job-2", "interrupt_flow", 1, json!({})).await;
    f.machine
        .process_job_message(&job_message("job-2", "interrupt_flow", 1, json!({})))
        .await
        .unwrap();

    let (task_msg, delivery) = next_task_message(&f).await;
    let disposition = f
        .machine
        .process_task_message(&task_msg, delivery, &ExecutionEnv::short("test-worker"))
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Abandon);
    assert_eq!(
        f.store.task_status(&task_msg.task_id),
        Some(TaskStatus::Processing)
    );
    let job = f.store.get_job("job-2").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn retryable_failure_abandons_then_fails_when_exhausted() {
    let f = fixture();
    seed_job(&f, "job-3", "retry_flow", 1, json!({})).await;
    f.machine
        .process_job_message(&job_message("job-3", "retry_flow", 1, json!({})))
        .await
        .unwrap();

    let (task_msg, _) = next_task_message(&f).await;

    let disposition = f
        .machine
        .process_task_message(
            &task_msg,
            DeliveryInfo {
                delivery_count: 1,
                max_delivery_count: 3,
            },
            &ExecutionEnv::short("test-worker"),
        )
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Abandon);
    assert_eq!(
        f.store.task_status(&task_msg.task_id),
        Some(TaskStatus::Processing)
    );

    // Final delivery: retry budget exhausted, task fails permanently
    let disposition = f
        .machine
        .process_task_message(
            &task_msg,
            DeliveryInfo {
                delivery_count: 3,
                max_delivery_count: 3,
            },
            &ExecutionEnv::short("test-worker"),
        )
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Complete);
    assert_eq!(
        f.store.task_status(&task_msg.task_id),
        Some(TaskStatus::Failed)
    );

    let job = f.store.get_job("job-3").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert!(job.error_details.unwrap().contains("connection reset"));
}

#[tokio::test]
async fn fail_job_policy_terminates_the_job_as_failed() {
    let f = fixture();
    seed_job(&f, "job-strict", "strict_flow", 1, json!({})).await;
    f.machine
        .process_job_message(&job_message("job-strict", "strict_flow", 1, json!({})))
        .await
        .unwrap();

    let (task_msg, delivery) = next_task_message(&f).await;
    let disposition = f
        .machine
        .process_task_message(&task_msg, delivery, &ExecutionEnv::short("test-worker"))
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Complete);

    let job = f.store.get_job("job-strict").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_details.unwrap().contains("SOURCE_NOT_FOUND"));
    assert!(job.result_data.is_none());
}

#[tokio::test]
async fn handler_panic_is_a_permanent_failure() {
    let f = fixture();
    seed_job(&f, "job-panic", "panic_flow", 1, json!({})).await;
    f.machine
        .process_job_message(&job_message("job-panic", "panic_flow", 1, json!({})))
        .await
        .unwrap();

    let (task_msg, delivery) = next_task_message(&f).await;
    let disposition = f
        .machine
        .process_task_message(&task_msg, delivery, &ExecutionEnv::short("test-worker"))
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Complete);

    assert_eq!(
        f.store.task_status(&task_msg.task_id),
        Some(TaskStatus::Failed)
    );
    let job = f.store.get_job("job-panic").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::CompletedWithErrors);
    assert!(job.error_details.unwrap().contains("panicked"));
}

#[tokio::test]
async fn terminal_task_redelivery_is_a_noop_ack() {
    let f = fixture();
    seed_job(&f, "job-4", "echo", 1, json!({"msg": "done"})).await;
    f.machine
        .process_job_message(&job_message("job-4", "echo", 1, json!({"msg": "done"})))
        .await
        .unwrap();

    let (task_msg, delivery) = next_task_message(&f).await;
    f.machine
        .process_task_message(&task_msg, delivery, &ExecutionEnv::short("test-worker"))
        .await
        .unwrap();
    let job = f.store.get_job("job-4").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // Reinject the same task message
    let disposition = f
        .machine
        .process_task_message(
            &task_msg,
            DeliveryInfo {
                delivery_count: 2,
                max_delivery_count: 3,
            },
            &ExecutionEnv::short("test-worker"),
        )
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Complete);
    // No duplicate stage advancement: the job queue stays empty
    assert_eq!(f.broker.pending_count(JOB_QUEUE), 0);
}

#[tokio::test]
async fn empty_fan_out_completes_the_stage_with_no_work() {
    let f = fixture();
    seed_job(&f, "job-5", "empty_fan_out", 1, json!({})).await;

    let disposition = f
        .machine
        .process_job_message(&job_message("job-5", "empty_fan_out", 1, json!({})))
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Complete);

    let job = f.store.get_job("job-5").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let summary = &job.stage_results[&1];
    assert_eq!((summary.total, summary.succeeded, summary.failed), (0, 0, 0));
    assert_eq!(f.store.task_count_for_stage("job-5", 1), 0);
}

#[tokio::test]
async fn stage_completion_enqueues_next_stage_exactly_once() {
    let f = fixture();
    seed_job(&f, "job-6", "two_stage", 2, json!({"msg": "x"})).await;
    f.machine
        .process_job_message(&job_message("job-6", "two_stage", 1, json!({"msg": "x"})))
        .await
        .unwrap();

    let (task_msg, delivery) = next_task_message(&f).await;
    f.machine
        .process_task_message(&task_msg, delivery, &ExecutionEnv::short("test-worker"))
        .await
        .unwrap();

    // Exactly one stage-2 job message was emitted
    assert_eq!(f.broker.pending_count(JOB_QUEUE), 1);
    let delivered = f.broker.receive(JOB_QUEUE, 10, Duration::ZERO).await.unwrap();
    assert_eq!(delivered.len(), 1);
    let next: JobMessage = serde_json::from_value(delivered[0].body.clone()).unwrap();
    assert_eq!(next.stage, 2);

    // Stage 1 summary recorded before advancement
    let job = f.store.get_job("job-6").await.unwrap().unwrap();
    assert_eq!(job.stage_results[&1].succeeded, 1);
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn fan_in_stage_receives_previous_results() {
    let f = fixture();
    seed_job(&f, "job-7", "two_stage", 2, json!({"msg": "x"})).await;
    f.machine
        .process_job_message(&job_message("job-7", "two_stage", 1, json!({"msg": "x"})))
        .await
        .unwrap();
    let (task_msg, delivery) = next_task_message(&f).await;
    f.machine
        .process_task_message(&task_msg, delivery, &ExecutionEnv::short("test-worker"))
        .await
        .unwrap();

    // Pump the stage-2 job message
    let delivered = f.broker.receive(JOB_QUEUE, 1, Duration::ZERO).await.unwrap();
    let next: JobMessage = serde_json::from_value(delivered[0].body.clone()).unwrap();
    f.machine.process_job_message(&next).await.unwrap();

    let (fan_in_msg, _) = next_task_message(&f).await;
    let previous = fan_in_msg.parameters["_previous_results"]
        .as_array()
        .expect("fan_in parameters carry previous results");
    assert_eq!(previous.len(), 1);
    assert_eq!(previous[0]["result"]["msg"], "x");
}
