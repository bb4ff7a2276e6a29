//! Interrupt-and-resume: a long-running handler checkpoints between
//! phases, yields on shutdown, and a later delivery resumes past the
//! completed phases.

use std::sync::Arc;
use std::time::Duration;

use geoflow_core::application::{
    ExecutionEnv, QueueKind, QueueWorker, QueueWorkerOptions, ShutdownSignal,
};
use geoflow_core::domain::{JobMessage, JobStatus, TaskStatus};
use geoflow_core::port::{MessageBroker, StateStore};
use serde_json::json;

use geoflow_integration_tests::{
    register_phased_copy, PhaseLog, TestEngine, JOB_QUEUE, LONG_QUEUE,
};

fn long_worker(engine: &TestEngine, env: ExecutionEnv) -> QueueWorker {
    QueueWorker::new(
        LONG_QUEUE,
        QueueKind::Tasks,
        engine.broker.clone(),
        engine.machine.clone(),
        env,
        QueueWorkerOptions {
            renew_locks: false,
            max_delivery_count: 5,
            ..QueueWorkerOptions::long()
        },
    )
}

#[tokio::test]
async fn shutdown_interrupts_and_redelivery_resumes_from_checkpoint() {
    let log = Arc::new(PhaseLog::default());
    let log_for_registry = log.clone();
    let engine = TestEngine::new(move |workflows, handlers| {
        register_phased_copy(workflows, handlers, log_for_registry);
    })
    .await
    .unwrap();

    let receipt = engine
        .submission
        .submit("phased_copy", &json!({"blob": "large-scene.tif"}))
        .await
        .unwrap();

    // Dispatch stage 1; the task routes to the long queue
    let jobs = engine
        .broker
        .receive(JOB_QUEUE, 1, Duration::from_secs(1))
        .await
        .unwrap();
    let stage1: JobMessage = serde_json::from_value(jobs[0].body.clone()).unwrap();
    engine.machine.process_job_message(&stage1).await.unwrap();
    engine.broker.complete(&jobs[0]).await.unwrap();

    // First delivery: shutdown is already signalled, so the handler runs
    // phase 1, checkpoints it, and yields
    let draining = ShutdownSignal::new();
    draining.trigger();
    let env1 = ExecutionEnv::long("worker-1", engine.checkpoints.clone(), draining);
    assert!(long_worker(&engine, env1).poll_once().await.unwrap());

    assert_eq!(log.executed(), vec![1]);
    let tasks = engine.store.list_tasks(&receipt.job_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    // Abandoned, not completed: still non-terminal with its checkpoint
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.checkpoint_phase, 1);
    assert_eq!(task.checkpoint_data.as_ref().unwrap()["last_phase"], 1);

    let job = engine.submission.status(&receipt.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    // Worker restart: fresh signal, message redelivered
    let env2 = ExecutionEnv::long(
        "worker-2",
        engine.checkpoints.clone(),
        ShutdownSignal::new(),
    );
    assert!(long_worker(&engine, env2).poll_once().await.unwrap());

    // Phase 1 skipped, 2 and 3 executed exactly once
    assert_eq!(log.executed(), vec![1, 2, 3]);

    let job = engine.submission.status(&receipt.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data.as_ref().unwrap()["phases"], 3);
    let summary = &job.stage_results[&1];
    assert_eq!((summary.total, summary.succeeded, summary.failed), (1, 1, 0));

    let tasks = engine.store.list_tasks(&receipt.job_id).await.unwrap();
    let task = &tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    // Checkpoint retained so a late redelivery observes finished work
    assert_eq!(task.checkpoint_phase, 3);
    assert_eq!(task.executed_by_app.as_deref(), Some("worker-2"));
    assert!(task.execution_started_at.is_some());

    // Queue is drained; no further deliveries
    assert!(engine
        .broker
        .receive(LONG_QUEUE, 10, Duration::ZERO)
        .await
        .unwrap()
        .is_empty());
}
