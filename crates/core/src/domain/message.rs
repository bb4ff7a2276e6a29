// Broker Message Payloads

use serde::{Deserialize, Serialize};

use crate::domain::job::JobId;
use crate::domain::task::TaskId;

/// Dispatch message for one stage of a job. Stage 1 is emitted at
/// submission; stage N+1 by the completion-check winner of stage N.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub job_type: String,
    pub stage: u32,
    pub parameters: serde_json::Value,
    pub correlation_id: String,
}

/// Dispatch message for one task within a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub parent_job_id: JobId,
    pub job_type: String,
    pub task_type: String,
    pub stage: u32,
    pub task_index: u32,
    pub parameters: serde_json::Value,
    pub correlation_id: String,
}
