// Built-in workflows
//
// The engine ships a single diagnostic pipeline; real geospatial
// workflows (raster ingest, vector ingest, STAC extraction) register
// their definitions and handlers alongside it at startup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::application::handler::{HandlerResult, TaskContext, TaskHandler};
use crate::application::registry::{HandlerRegistry, Workflow, WorkflowRegistry};
use crate::domain::{Parallelism, StageDefinition, TaskDescriptor, TaskResult};
use crate::error::Result;

/// One-stage smoke-test pipeline: submit with arbitrary parameters, get
/// them echoed back as the job result. Lets an operator verify a
/// deployment end-to-end with the CLI.
struct EchoWorkflow {
    stages: Vec<StageDefinition>,
}

impl EchoWorkflow {
    fn new() -> Self {
        Self {
            stages: vec![StageDefinition::new(1, "echo", "echo", Parallelism::Single)],
        }
    }
}

#[async_trait]
impl Workflow for EchoWorkflow {
    fn job_type(&self) -> &str {
        "echo"
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
        Ok(vec![TaskDescriptor::new("echo", parameters.clone())])
    }
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, parameters: &serde_json::Value, ctx: &TaskContext) -> HandlerResult {
        tracing::info!(task_id = %ctx.task_id, "echo task executed");
        HandlerResult::ok(parameters.clone())
    }
}

/// Register the built-in workflows and handlers.
pub fn register_builtin(workflows: &mut WorkflowRegistry, handlers: &mut HandlerRegistry) {
    workflows.register(Arc::new(EchoWorkflow::new()));
    handlers.register("echo", Arc::new(EchoHandler));
}
