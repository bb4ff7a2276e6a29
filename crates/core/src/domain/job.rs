// Job Domain Model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::{DomainError, Result};

/// Job ID (SHA-256 content hash of job_type + canonical parameters)
pub type JobId = String;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    /// Terminal statuses are sinks: no further transitions are valid.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    /// Valid transitions: QUEUED -> PROCESSING -> {COMPLETED, COMPLETED_WITH_ERRORS, FAILED}.
    /// Same-status transitions are idempotent no-ops.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            JobStatus::Queued => next == JobStatus::Processing,
            JobStatus::Processing => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::CompletedWithErrors => write!(f, "COMPLETED_WITH_ERRORS"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(JobStatus::CompletedWithErrors),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(DomainError::Internal(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Aggregated outcome of a fully completed stage.
///
/// Written exactly once per stage, by the completion-check winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Job entity: one submission instance walking through its workflow stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub parameters: serde_json::Value,
    pub status: JobStatus,

    /// Current 1-based stage index. Monotonically non-decreasing.
    pub stage: u32,
    pub total_stages: u32,

    /// Per-stage aggregation, keyed by stage index. Set only after the stage
    /// is fully complete.
    pub stage_results: BTreeMap<u32, StageSummary>,

    /// Final aggregation, set at job finalization.
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<String>,

    pub created_at: i64, // epoch ms
    pub updated_at: i64,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        job_type: impl Into<String>,
        parameters: serde_json::Value,
        total_stages: u32,
        created_at: i64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            parameters,
            status: JobStatus::Queued,
            stage: 1,
            total_stages,
            stage_results: BTreeMap::new(),
            result_data: None,
            error_details: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Validate and apply a status transition.
    pub fn transition_to(&mut self, next: JobStatus, now_millis: i64) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidJobTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now_millis;
        Ok(())
    }

    /// Count of failed tasks across all recorded stage summaries.
    pub fn total_failed_tasks(&self) -> i64 {
        self.stage_results.values().map(|s| s.failed).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_sinks() {
        for terminal in [
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobStatus::Processing));
            assert!(!terminal.can_transition_to(JobStatus::Queued));
            // Idempotent same-state is allowed
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn queued_only_moves_to_processing() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut job = JobRecord::new("j1", "echo", serde_json::json!({}), 1, 1000);
        job.transition_to(JobStatus::Processing, 2000).unwrap();
        job.transition_to(JobStatus::Completed, 3000).unwrap();

        let err = job.transition_to(JobStatus::Processing, 4000).unwrap_err();
        assert!(matches!(err, DomainError::InvalidJobTransition { .. }));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
