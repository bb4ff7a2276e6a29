//! StateStore contract tests against the SQLite adapter.

use geoflow_core::domain::{JobRecord, JobStatus, StageSummary, TaskRecord, TaskStatus};
use geoflow_core::port::{StateStore, TaskOutcome};
use geoflow_core::EngineError;
use serde_json::json;

use geoflow_integration_tests::TestEngine;

async fn engine() -> TestEngine {
    TestEngine::new(|_, _| {}).await.unwrap()
}

async fn seed_job(e: &TestEngine, job_id: &str) {
    let job = JobRecord::new(job_id, "echo", json!({}), 2, 1_000);
    e.store.create_job(&job).await.unwrap();
}

fn task(job_id: &str, task_id: &str, stage: u32, index: u32) -> TaskRecord {
    TaskRecord::new(
        task_id,
        job_id,
        "echo",
        "echo",
        stage,
        index,
        json!({}),
        "tasks-short",
        1_000,
    )
}

#[tokio::test]
async fn duplicate_job_insert_is_rejected() {
    let e = engine().await;
    seed_job(&e, "j1").await;

    let dup = JobRecord::new("j1", "echo", json!({}), 2, 2_000);
    let err = e.store.create_job(&dup).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn job_status_transitions_follow_the_matrix() {
    let e = engine().await;
    seed_job(&e, "j1").await;

    // QUEUED -> COMPLETED is invalid
    let err = e
        .store
        .update_job_status("j1", JobStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    e.store
        .update_job_status("j1", JobStatus::Processing)
        .await
        .unwrap();
    // Idempotent repeat
    e.store
        .update_job_status("j1", JobStatus::Processing)
        .await
        .unwrap();

    e.store
        .finalize_job("j1", JobStatus::Completed, Some(&json!({"ok": true})), None)
        .await
        .unwrap();

    // Terminal sink: replay of the same finalization is a no-op, anything
    // else is invalid
    e.store
        .finalize_job("j1", JobStatus::Completed, None, None)
        .await
        .unwrap();
    let err = e
        .store
        .update_job_status("j1", JobStatus::Processing)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));
    let err = e
        .store
        .finalize_job("j1", JobStatus::Failed, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    let job = e.store.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data.unwrap()["ok"], true);
}

#[tokio::test]
async fn job_stage_is_monotonic() {
    let e = engine().await;
    seed_job(&e, "j1").await;

    e.store.update_job_stage("j1", 2).await.unwrap();
    // A stale lower stage is ignored
    e.store.update_job_stage("j1", 1).await.unwrap();

    let job = e.store.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.stage, 2);
}

#[tokio::test]
async fn upsert_task_is_idempotent_on_task_id() {
    let e = engine().await;
    seed_job(&e, "j1").await;

    let t = task("j1", "t1", 1, 0);
    assert!(e.store.upsert_task(&t).await.unwrap());
    assert!(!e.store.upsert_task(&t).await.unwrap());
}

#[tokio::test]
async fn execution_started_at_is_set_once() {
    let e = engine().await;
    seed_job(&e, "j1").await;
    e.store.upsert_task(&task("j1", "t1", 1, 0)).await.unwrap();

    let first = e
        .store
        .mark_task_processing("t1", 5_000, "worker-a", 0)
        .await
        .unwrap();
    assert_eq!(first.status, TaskStatus::Processing);
    assert_eq!(first.execution_started_at, Some(5_000));

    // Redelivery: PROCESSING -> PROCESSING keeps the original start time
    let second = e
        .store
        .mark_task_processing("t1", 9_000, "worker-b", 1)
        .await
        .unwrap();
    assert_eq!(second.execution_started_at, Some(5_000));
    assert_eq!(second.executed_by_app.as_deref(), Some("worker-b"));
    assert_eq!(second.retry_count, 1);
}

#[tokio::test]
async fn checkpoint_writes_are_monotonic_and_stop_at_terminal() {
    let e = engine().await;
    seed_job(&e, "j1").await;
    e.store.upsert_task(&task("j1", "t1", 1, 0)).await.unwrap();
    e.store
        .mark_task_processing("t1", 5_000, "w", 0)
        .await
        .unwrap();

    e.store
        .update_task_checkpoint("t1", 2, &json!({"p": 2}), 6_000)
        .await
        .unwrap();
    // Regression rejected
    let err = e
        .store
        .update_task_checkpoint("t1", 1, &json!({"p": 1}), 7_000)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    // Terminal task rejects further checkpoint writes but keeps the last one
    e.store
        .complete_task_and_check_stage("t1", "j1", 1, &TaskOutcome::completed(None))
        .await
        .unwrap();
    let err = e
        .store
        .update_task_checkpoint("t1", 3, &json!({"p": 3}), 8_000)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    let t = e.store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(t.checkpoint_phase, 2);
    assert_eq!(t.checkpoint_data.unwrap()["p"], 2);
}

#[tokio::test]
async fn completion_check_counts_mixed_outcomes() {
    let e = engine().await;
    seed_job(&e, "j1").await;
    for i in 0..3 {
        e.store
            .upsert_task(&task("j1", &format!("t{i}"), 1, i))
            .await
            .unwrap();
    }

    let c = e
        .store
        .complete_task_and_check_stage("t0", "j1", 1, &TaskOutcome::completed(Some(json!({}))))
        .await
        .unwrap();
    assert!(!c.stage_complete);
    assert_eq!((c.total, c.succeeded, c.failed), (3, 1, 0));

    let c = e
        .store
        .complete_task_and_check_stage("t1", "j1", 1, &TaskOutcome::failed("bad input"))
        .await
        .unwrap();
    assert!(!c.stage_complete);
    assert_eq!(c.failed, 1);

    let c = e
        .store
        .complete_task_and_check_stage("t2", "j1", 1, &TaskOutcome::completed(None))
        .await
        .unwrap();
    assert!(c.stage_complete);
    assert_eq!((c.total, c.succeeded, c.failed), (3, 2, 1));

    let completed = e.store.get_completed_tasks_for_stage("j1", 1).await.unwrap();
    assert_eq!(completed.len(), 2);
    let failed = e.store.get_failed_tasks("j1").await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("bad input"));
}

#[tokio::test]
async fn stage_results_accumulate_per_stage() {
    let e = engine().await;
    seed_job(&e, "j1").await;

    e.store
        .set_stage_result(
            "j1",
            1,
            &StageSummary {
                total: 1,
                succeeded: 1,
                failed: 0,
            },
        )
        .await
        .unwrap();
    e.store
        .set_stage_result(
            "j1",
            2,
            &StageSummary {
                total: 4,
                succeeded: 3,
                failed: 1,
            },
        )
        .await
        .unwrap();

    let job = e.store.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.stage_results.len(), 2);
    assert_eq!(job.stage_results[&2].failed, 1);
    assert_eq!(job.total_failed_tasks(), 1);
}
