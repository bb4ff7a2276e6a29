//! End-to-end test harness: a real SQLite-backed engine on a temp
//! database, plus the test workflows the scenarios exercise.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use geoflow_core::application::{
    CheckpointManager, CoreMachine, ExecutionEnv, HandlerRegistry, HandlerResult, QueueKind,
    QueueWorker, QueueWorkerOptions, RouterConfig, SubmissionService, TaskContext, TaskHandler,
    TaskRouter, Workflow, WorkflowRegistry,
};
use geoflow_core::domain::{
    Parallelism, StageDefinition, TaskDescriptor, TaskResult, PREVIOUS_RESULTS_KEY,
};
use geoflow_core::port::{SystemTimeProvider, UuidProvider};
use geoflow_core::Result;
use geoflow_infra_sqlite::{
    create_pool, run_migrations, BrokerConfig, PoolHandle, QueueOptions, SqliteMessageBroker,
    SqliteStateStore,
};

pub const JOB_QUEUE: &str = "jobs";
pub const SHORT_QUEUE: &str = "tasks-short";
pub const LONG_QUEUE: &str = "tasks-long";

pub struct TestEngine {
    pub store: Arc<SqliteStateStore>,
    pub broker: Arc<SqliteMessageBroker>,
    pub machine: Arc<CoreMachine>,
    pub submission: SubmissionService,
    pub checkpoints: Arc<CheckpointManager>,
    _dir: tempfile::TempDir,
}

impl TestEngine {
    /// Spin up an engine on a fresh temp database. `register` adds the
    /// workflows and handlers under test.
    pub async fn new(
        register: impl FnOnce(&mut WorkflowRegistry, &mut HandlerRegistry),
    ) -> Result<Self> {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("engine.db").display());

        let pool = PoolHandle::new(create_pool(&url, 5).await?);
        run_migrations(&pool.current().await).await?;

        let time = Arc::new(SystemTimeProvider);
        let ids = Arc::new(UuidProvider);
        let store = Arc::new(SqliteStateStore::new(pool.clone(), time.clone()));

        let broker_config = BrokerConfig::default().with_queue(
            LONG_QUEUE,
            QueueOptions {
                lock_duration: Duration::from_secs(300),
                max_delivery_count: 5,
            },
        );
        let broker = Arc::new(SqliteMessageBroker::new(
            pool.clone(),
            time.clone(),
            ids.clone(),
            broker_config,
        ));

        let mut workflows = WorkflowRegistry::new();
        let mut handlers = HandlerRegistry::new();
        geoflow_core::application::builtin::register_builtin(&mut workflows, &mut handlers);
        register(&mut workflows, &mut handlers);
        let workflows = Arc::new(workflows);
        let handlers = Arc::new(handlers);

        // Long-running task types go to the long queue
        let mut router_config = RouterConfig::default();
        router_config
            .long_queue_task_types
            .insert("phased_copy".to_string());

        let machine = Arc::new(CoreMachine::new(
            store.clone(),
            broker.clone(),
            workflows.clone(),
            handlers,
            TaskRouter::new(router_config),
            JOB_QUEUE,
            time.clone(),
            ids.clone(),
        ));

        let submission = SubmissionService::new(
            store.clone(),
            broker.clone(),
            workflows,
            JOB_QUEUE,
            time.clone(),
            ids,
        );
        let checkpoints = Arc::new(CheckpointManager::new(store.clone(), time));

        Ok(Self {
            store,
            broker,
            machine,
            submission,
            checkpoints,
            _dir: dir,
        })
    }

    fn workers(&self, env: &ExecutionEnv) -> Vec<QueueWorker> {
        let short = QueueWorkerOptions {
            renew_locks: false,
            ..QueueWorkerOptions::short()
        };
        let long = QueueWorkerOptions {
            renew_locks: false,
            max_delivery_count: 5,
            ..QueueWorkerOptions::long()
        };
        vec![
            QueueWorker::new(
                JOB_QUEUE,
                QueueKind::Jobs,
                self.broker.clone(),
                self.machine.clone(),
                env.clone(),
                short.clone(),
            ),
            QueueWorker::new(
                SHORT_QUEUE,
                QueueKind::Tasks,
                self.broker.clone(),
                self.machine.clone(),
                env.clone(),
                short,
            ),
            QueueWorker::new(
                LONG_QUEUE,
                QueueKind::Tasks,
                self.broker.clone(),
                self.machine.clone(),
                env.clone(),
                long,
            ),
        ]
    }

    /// Drain every queue deterministically: keep polling until a full
    /// sweep handles nothing. Suitable for scenarios whose messages all
    /// reach a terminal disposition.
    pub async fn pump(&self, env: &ExecutionEnv) -> Result<()> {
        let workers = self.workers(env);
        loop {
            let mut handled = false;
            for worker in &workers {
                while worker.poll_once().await? {
                    handled = true;
                }
            }
            if !handled {
                return Ok(());
            }
        }
    }

    /// Poll each queue at most once (single sweep), for scenarios that
    /// need to observe intermediate state.
    pub async fn pump_once(&self, env: &ExecutionEnv) -> Result<bool> {
        let mut handled = false;
        for worker in &self.workers(env) {
            if worker.poll_once().await? {
                handled = true;
            }
        }
        Ok(handled)
    }
}

// ---------------------------------------------------------------------------
// Test workflows
// ---------------------------------------------------------------------------

/// Three-stage pipeline: validate (single) -> process (fan_out per item)
/// -> summarize (fan_in). Items containing "bad" fail permanently in
/// stage 2.
pub struct ImageryPipeline {
    stages: Vec<StageDefinition>,
}

impl Default for ImageryPipeline {
    fn default() -> Self {
        Self {
            stages: vec![
                StageDefinition::new(1, "validate", "validate_items", Parallelism::Single),
                StageDefinition::new(2, "process", "process_item", Parallelism::FanOut),
                StageDefinition::new(3, "summarize", "summarize_items", Parallelism::FanIn),
            ],
        }
    }
}

#[async_trait]
impl Workflow for ImageryPipeline {
    fn job_type(&self) -> &str {
        "imagery_pipeline"
    }

    fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    fn plan_stage(
        &self,
        stage: &StageDefinition,
        parameters: &serde_json::Value,
        previous_results: &[TaskResult],
    ) -> Result<Vec<TaskDescriptor>> {
        match stage.number {
            1 => Ok(vec![TaskDescriptor::new(
                "validate_items",
                parameters.clone(),
            )]),
            2 => {
                // One task per validated item
                let items = previous_results
                    .first()
                    .and_then(|r| r.result.as_ref())
                    .and_then(|r| r.get("items"))
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                Ok(items
                    .into_iter()
                    .map(|item| TaskDescriptor::new("process_item", json!({ "item": item })))
                    .collect())
            }
            _ => Ok(vec![TaskDescriptor::new("summarize_items", json!({}))]),
        }
    }
}

pub struct ValidateHandler;

#[async_trait]
impl TaskHandler for ValidateHandler {
    async fn execute(&self, parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        let items = parameters
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        HandlerResult::ok(json!({ "validated": items.len(), "items": items }))
    }
}

pub struct ProcessItemHandler;

#[async_trait]
impl TaskHandler for ProcessItemHandler {
    async fn execute(&self, parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        let item = parameters
            .get("item")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if item.contains("bad") {
            return HandlerResult::permanent(format!("source missing for item {item}"))
                .with_error_code("SOURCE_NOT_FOUND");
        }
        HandlerResult::ok(json!({ "processed": item }))
    }
}

pub struct SummarizeHandler;

#[async_trait]
impl TaskHandler for SummarizeHandler {
    async fn execute(&self, parameters: &serde_json::Value, _ctx: &TaskContext) -> HandlerResult {
        let previous = parameters
            .get(PREVIOUS_RESULTS_KEY)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let processed: Vec<serde_json::Value> = previous
            .iter()
            .filter_map(|r| r.get("result").and_then(|v| v.get("processed")).cloned())
            .collect();
        HandlerResult::ok(json!({ "count": processed.len(), "processed": processed }))
    }
}

pub fn register_imagery_pipeline(
    workflows: &mut WorkflowRegistry,
    handlers: &mut HandlerRegistry,
) {
    workflows.register(Arc::new(ImageryPipeline::default()));
    handlers.register("validate_items", Arc::new(ValidateHandler));
    handlers.register("process_item", Arc::new(ProcessItemHandler));
    handlers.register("summarize_items", Arc::new(SummarizeHandler));
}

/// Single long-running stage whose handler copies in three checkpointed
/// phases and yields between phases when shutdown is signalled.
pub struct PhasedCopyWorkflow {
    stages: Vec<StageDefinition>,
}

impl Default for PhasedCopyWorkflow {
    fn default() -> Self {
        Self {
            stages: vec![StageDefinition::new(
                1,
                "copy",
                "phased_copy",
                Parallelism::Single,
            )],
        }
    }
}

#[async_trait]
impl Workflow for PhasedCopyWorkflow {
    fn job_type(&self) -> &str {
        "phased_copy"
    }

    fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    fn plan_stage(
        &self,
        _stage: &StageDefinition,
        parameters: &serde_json::Value,
        _previous_results: &[TaskResult],
    ) -> Result<Vec<TaskDescriptor>> {
        Ok(vec![TaskDescriptor::new("phased_copy", parameters.clone())])
    }
}

/// Records which phases actually ran, across deliveries.
#[derive(Default)]
pub struct PhaseLog {
    executed: Mutex<Vec<u32>>,
}

impl PhaseLog {
    pub fn executed(&self) -> Vec<u32> {
        self.executed.lock().unwrap().clone()
    }

    fn record(&self, phase: u32) {
        self.executed.lock().unwrap().push(phase);
    }
}

pub struct PhasedCopyHandler {
    pub log: Arc<PhaseLog>,
}

#[async_trait]
impl TaskHandler for PhasedCopyHandler {
    async fn execute(&self, _parameters: &serde_json::Value, ctx: &TaskContext) -> HandlerResult {
        let Some(checkpoint) = ctx.checkpoint() else {
            return HandlerResult::permanent("phased_copy requires a long-running context");
        };

        for phase in 1..=3u32 {
            if checkpoint.should_skip(phase) {
                continue;
            }
            // Yield between phases once shutdown is requested
            if phase > 1 && ctx.shutdown_requested() {
                return HandlerResult::interrupted(phase - 1);
            }
            self.log.record(phase);
            if let Err(e) = checkpoint.save(phase, json!({ "last_phase": phase })).await {
                return HandlerResult::retryable(format!("checkpoint save failed: {e}"));
            }
            ctx.report_progress((phase * 33) as u8, &format!("phase {phase} done")).await;
        }
        HandlerResult::ok(json!({ "phases": 3 }))
    }
}

pub fn register_phased_copy(
    workflows: &mut WorkflowRegistry,
    handlers: &mut HandlerRegistry,
    log: Arc<PhaseLog>,
) {
    workflows.register(Arc::new(PhasedCopyWorkflow::default()));
    handlers.register("phased_copy", Arc::new(PhasedCopyHandler { log }));
}
