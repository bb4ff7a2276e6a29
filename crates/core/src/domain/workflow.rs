// Workflow Domain Model - static stage definitions

use serde::{Deserialize, Serialize};

/// How a stage fans out into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// Exactly one task.
    Single,
    /// N independent parallel tasks, N computed from previous results or parameters.
    FanOut,
    /// Exactly one task receiving the aggregated previous-stage results.
    FanIn,
}

/// One stage of a workflow definition. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// 1-based stage number.
    pub number: u32,
    pub name: String,
    pub task_type: String,
    pub parallelism: Parallelism,
}

impl StageDefinition {
    pub fn new(
        number: u32,
        name: impl Into<String>,
        task_type: impl Into<String>,
        parallelism: Parallelism,
    ) -> Self {
        Self {
            number,
            name: name.into(),
            task_type: task_type.into(),
            parallelism,
        }
    }
}

/// What to do with the job when a stage ends with failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep advancing; the job terminates as COMPLETED_WITH_ERRORS.
    ContinueWithErrors,
    /// Terminate the job as FAILED at the first stage with failures.
    FailJob,
}

/// Task blueprint produced by a workflow's stage factory.
///
/// The task_index is the descriptor's position in the returned list; the
/// task_id is derived from it deterministically.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task_type: String,
    pub parameters: serde_json::Value,
}

impl TaskDescriptor {
    pub fn new(task_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
        }
    }
}

/// Parameter key under which fan_in tasks receive the previous stage's results.
pub const PREVIOUS_RESULTS_KEY: &str = "_previous_results";
