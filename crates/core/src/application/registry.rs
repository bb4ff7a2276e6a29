// Workflow & Handler Registries
//
// Read-mostly after initialization: both registries are populated at
// process start and wrapped in Arc. A lookup miss at runtime is a
// deployment defect and dead-letters the message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::application::handler::TaskHandler;
use crate::domain::{
    FailurePolicy, JobRecord, StageDefinition, TaskDescriptor, TaskResult,
};
use crate::error::{EngineError, Result};

/// Declarative multi-stage workflow keyed by job_type.
#[async_trait]
pub trait Workflow: Send + Sync {
    fn job_type(&self) -> &str;

    /// Ordered stage definitions. Immutable once registered.
    fn stages(&self) -> &[StageDefinition];

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::ContinueWithErrors
    }

    /// Schema validation + cross-field checks at submission time; returns
    /// the normalized parameters that feed the deterministic job id.
    fn validate(&self, parameters: &serde_json::Value) -> Result<serde_json::Value> {
        Ok(parameters.clone())
    }

    /// Task-definition factory for one stage: one descriptor for
    /// single/fan_in stages, N for fan_out (N computed from
    /// `previous_results` or parameters).
    fn plan_stage(
        &self,
        stage: &StageDefinition,
        parameters: &serde_json::Value,
        previous_results: &[TaskResult],
    ) -> Result<Vec<TaskDescriptor>>;

    /// Final aggregation hook; `None` falls back to the default
    /// (the last stage's single result, or a result list).
    async fn finalize(
        &self,
        job: &JobRecord,
        final_results: &[TaskResult],
    ) -> Result<Option<serde_json::Value>> {
        let _ = (job, final_results);
        Ok(None)
    }
}

impl std::fmt::Debug for dyn Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow").field("job_type", &self.job_type()).finish()
    }
}

/// `job_type -> WorkflowDefinition` lookup.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        let job_type = workflow.job_type().to_string();
        if self
            .workflows
            .insert(job_type.clone(), workflow)
            .is_some()
        {
            tracing::warn!(job_type = %job_type, "workflow re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, job_type: &str) -> Result<Arc<dyn Workflow>> {
        self.workflows
            .get(job_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownJobType(job_type.to_string()))
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }
}

/// `task_type -> handler` lookup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        if self
            .handlers
            .insert(task_type.clone(), handler)
            .is_some()
        {
            tracing::warn!(task_type = %task_type, "handler re-registered, previous handler replaced");
        }
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTaskType(task_type.to_string()))
    }
}
