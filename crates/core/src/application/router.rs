// Task Router - chooses the destination queue for each task
//
// Pure function of its inputs; no I/O. Determinism here keeps redispatch
// of the same stage idempotent.

use std::collections::{HashMap, HashSet};

/// Job-parameter key that force-routes every task of a job.
const PROCESSING_MODE_KEY: &str = "processing_mode";

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_queue: String,
    pub long_queue: String,
    /// Specialized queues pinned per task_type.
    pub queue_pins: HashMap<String, String>,
    /// Task types that always go to the long queue.
    pub long_queue_task_types: HashSet<String>,
    /// Serialized task parameters above this size route long.
    pub size_threshold_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_queue: "tasks-short".to_string(),
            long_queue: "tasks-long".to_string(),
            queue_pins: HashMap::new(),
            long_queue_task_types: HashSet::new(),
            size_threshold_bytes: 32 * 1024 * 1024,
        }
    }
}

pub struct TaskRouter {
    config: RouterConfig,
}

impl TaskRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Routing rules, evaluated in order:
    /// 1. job-level `processing_mode = "long"` override
    /// 2. per-task-type queue pin
    /// 3. long-queue task-type allowlist
    /// 4. estimated payload size threshold
    /// 5. default queue
    pub fn route(
        &self,
        task_type: &str,
        task_parameters: &serde_json::Value,
        job_parameters: &serde_json::Value,
    ) -> String {
        if job_parameters
            .get(PROCESSING_MODE_KEY)
            .and_then(|v| v.as_str())
            == Some("long")
        {
            return self.config.long_queue.clone();
        }

        if let Some(queue) = self.config.queue_pins.get(task_type) {
            return queue.clone();
        }

        if self.config.long_queue_task_types.contains(task_type) {
            return self.config.long_queue.clone();
        }

        if estimated_payload_bytes(task_parameters) > self.config.size_threshold_bytes {
            return self.config.long_queue.clone();
        }

        self.config.default_queue.clone()
    }
}

/// Serialized size as the payload estimate. Cheap and deterministic.
fn estimated_payload_bytes(parameters: &serde_json::Value) -> usize {
    parameters.to_string().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> TaskRouter {
        let mut config = RouterConfig {
            size_threshold_bytes: 64,
            ..RouterConfig::default()
        };
        config
            .long_queue_task_types
            .insert("reproject_raster".to_string());
        config
            .queue_pins
            .insert("stac_extract".to_string(), "tasks-stac".to_string());
        TaskRouter::new(config)
    }

    #[test]
    fn processing_mode_override_wins() {
        let r = router();
        let queue = r.route("validate", &json!({}), &json!({"processing_mode": "long"}));
        assert_eq!(queue, "tasks-long");
    }

    #[test]
    fn queue_pin_beats_allowlist_and_size() {
        let r = router();
        let queue = r.route("stac_extract", &json!({}), &json!({}));
        assert_eq!(queue, "tasks-stac");
    }

    #[test]
    fn allowlisted_task_type_routes_long() {
        let r = router();
        let queue = r.route("reproject_raster", &json!({}), &json!({}));
        assert_eq!(queue, "tasks-long");
    }

    #[test]
    fn oversized_payload_routes_long() {
        let r = router();
        let big = json!({"items": "x".repeat(128)});
        assert_eq!(r.route("validate", &big, &json!({})), "tasks-long");
        assert_eq!(r.route("validate", &json!({}), &json!({})), "tasks-short");
    }

    #[test]
    fn routing_is_deterministic() {
        let r = router();
        let params = json!({"blob": "scene.tif"});
        let job = json!({"collection": "sentinel"});
        let first = r.route("validate", &params, &job);
        for _ in 0..10 {
            assert_eq!(r.route("validate", &params, &job), first);
        }
    }
}
