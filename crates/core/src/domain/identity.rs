// Deterministic Identifiers
//
// Job and task ids are content hashes so that resubmission and redelivery
// converge on the same rows. serde_json's default map is ordered, so
// serializing a Value yields canonical key order at every nesting level.

use sha2::{Digest, Sha256};

/// Deterministic job id: SHA-256 over job_type + canonical parameters.
pub fn job_id(job_type: &str, normalized_params: &serde_json::Value) -> String {
    let canonical = normalized_params.to_string();
    let digest = Sha256::digest(format!("{job_type}\n{canonical}").as_bytes());
    format!("{:x}", digest)
}

/// Deterministic task id, stable across retries of the same logical task.
pub fn task_id(job_id: &str, stage: u32, task_type: &str, task_index: u32) -> String {
    let digest = Sha256::digest(format!("{job_id}\n{stage}\n{task_type}\n{task_index}").as_bytes());
    format!("{:x}", digest)
}
