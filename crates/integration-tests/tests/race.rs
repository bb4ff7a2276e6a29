//! Concurrency: the advisory-locked completion check under racing
//! completers. At most one caller per (job, stage) may observe
//! stage_complete and emit the next stage's dispatch.

use std::time::Duration;

use geoflow_core::application::{DeliveryInfo, Disposition, ExecutionEnv};
use geoflow_core::domain::{JobMessage, JobStatus, TaskMessage, TaskStatus};
use geoflow_core::port::{MessageBroker, StateStore, TaskOutcome};
use serde_json::json;
use tokio::task::JoinSet;

use geoflow_integration_tests::{register_imagery_pipeline, TestEngine, JOB_QUEUE, SHORT_QUEUE};

fn env() -> ExecutionEnv {
    ExecutionEnv::short("race-worker")
}

async fn receive_task(engine: &TestEngine) -> (TaskMessage, geoflow_core::port::DeliveredMessage) {
    let delivered = engine
        .broker
        .receive(SHORT_QUEUE, 1, Duration::from_secs(1))
        .await
        .unwrap();
    let msg = delivered.into_iter().next().expect("task message");
    let task: TaskMessage = serde_json::from_value(msg.body.clone()).unwrap();
    (task, msg)
}

/// Drive a 4-task fan-out stage, complete the first two tasks serially,
/// then race the final two through the machine concurrently. Exactly one
/// next-stage job-message may appear.
#[tokio::test]
async fn concurrent_final_completions_advance_once() {
    let engine = TestEngine::new(register_imagery_pipeline).await.unwrap();

    let receipt = engine
        .submission
        .submit("imagery_pipeline", &json!({"items": ["a", "b", "c", "d"]}))
        .await
        .unwrap();

    // Stage 1: dispatch + validate task
    let jobs = engine
        .broker
        .receive(JOB_QUEUE, 1, Duration::from_secs(1))
        .await
        .unwrap();
    let stage1: JobMessage = serde_json::from_value(jobs[0].body.clone()).unwrap();
    engine.machine.process_job_message(&stage1).await.unwrap();
    engine.broker.complete(&jobs[0]).await.unwrap();

    let (task, delivered) = receive_task(&engine).await;
    engine
        .machine
        .process_task_message(
            &task,
            DeliveryInfo {
                delivery_count: delivered.delivery_count,
                max_delivery_count: 3,
            },
            &env(),
        )
        .await
        .unwrap();
    engine.broker.complete(&delivered).await.unwrap();

    // Stage 2: dispatch the four fan-out tasks
    let jobs = engine
        .broker
        .receive(JOB_QUEUE, 1, Duration::from_secs(1))
        .await
        .unwrap();
    let stage2: JobMessage = serde_json::from_value(jobs[0].body.clone()).unwrap();
    assert_eq!(stage2.stage, 2);
    engine.machine.process_job_message(&stage2).await.unwrap();
    engine.broker.complete(&jobs[0]).await.unwrap();

    // Complete the first two serially
    for _ in 0..2 {
        let (task, delivered) = receive_task(&engine).await;
        engine
            .machine
            .process_task_message(
                &task,
                DeliveryInfo {
                    delivery_count: delivered.delivery_count,
                    max_delivery_count: 3,
                },
                &env(),
            )
            .await
            .unwrap();
        engine.broker.complete(&delivered).await.unwrap();
    }

    // Race the last two
    let (task_a, msg_a) = receive_task(&engine).await;
    let (task_b, msg_b) = receive_task(&engine).await;
    assert_ne!(task_a.task_id, task_b.task_id);

    let mut set = JoinSet::new();
    for (task, delivered) in [(task_a, msg_a), (task_b, msg_b)] {
        let machine = engine.machine.clone();
        let broker = engine.broker.clone();
        let env = env();
        set.spawn(async move {
            let disposition = machine
                .process_task_message(
                    &task,
                    DeliveryInfo {
                        delivery_count: delivered.delivery_count,
                        max_delivery_count: 3,
                    },
                    &env,
                )
                .await
                .unwrap();
            broker.complete(&delivered).await.unwrap();
            disposition
        });
    }
    while let Some(result) = set.join_next().await {
        assert_eq!(result.unwrap(), Disposition::Complete);
    }

    // Exactly one stage-3 job-message was emitted
    let next = engine
        .broker
        .receive(JOB_QUEUE, 10, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(next.len(), 1, "expected exactly one next-stage dispatch");
    let stage3: JobMessage = serde_json::from_value(next[0].body.clone()).unwrap();
    assert_eq!(stage3.stage, 3);

    // And stage 2 is fully accounted for
    let job = engine.submission.status(&receipt.job_id).await.unwrap();
    assert_eq!(job.stage_results[&2].succeeded, 4);
}

/// Store-level version of the same property: racing
/// complete_task_and_check_stage calls for the final tasks of a stage
/// yield exactly one stage_complete = true.
#[tokio::test]
async fn completion_check_has_exactly_one_winner() {
    let engine = TestEngine::new(register_imagery_pipeline).await.unwrap();

    // Seed a job with a 4-task stage directly through the store
    let receipt = engine
        .submission
        .submit("imagery_pipeline", &json!({"items": ["a", "b", "c", "d"]}))
        .await
        .unwrap();
    let job_id = receipt.job_id.clone();

    use geoflow_core::domain::TaskRecord;
    for index in 0..4u32 {
        let task = TaskRecord::new(
            format!("race-{index}"),
            job_id.clone(),
            "imagery_pipeline",
            "process_item",
            2,
            index,
            json!({}),
            "tasks-short",
            1_000,
        );
        engine.store.upsert_task(&task).await.unwrap();
    }

    // Two tasks already done
    for index in 0..2 {
        let completion = engine
            .store
            .complete_task_and_check_stage(
                &format!("race-{index}"),
                &job_id,
                2,
                &TaskOutcome::completed(Some(json!({}))),
            )
            .await
            .unwrap();
        assert!(!completion.stage_complete);
    }

    // Race the final two completions
    let mut set = JoinSet::new();
    for index in 2..4 {
        let store = engine.store.clone();
        let job_id = job_id.clone();
        set.spawn(async move {
            store
                .complete_task_and_check_stage(
                    &format!("race-{index}"),
                    &job_id,
                    2,
                    &TaskOutcome::completed(Some(json!({}))),
                )
                .await
                .unwrap()
        });
    }

    let mut winners = 0;
    while let Some(result) = set.join_next().await {
        let completion = result.unwrap();
        if completion.stage_complete {
            winners += 1;
            assert_eq!(completion.total, 4);
            assert_eq!(completion.succeeded, 4);
        }
    }
    assert_eq!(winners, 1, "exactly one completion-check winner");

    // Duplicate completion afterwards never claims the win
    let replay = engine
        .store
        .complete_task_and_check_stage(
            "race-3",
            &job_id,
            2,
            &TaskOutcome::completed(Some(json!({}))),
        )
        .await
        .unwrap();
    assert!(!replay.stage_complete);
    assert_eq!(
        engine.store.get_task("race-3").await.unwrap().unwrap().status,
        TaskStatus::Completed
    );

    // The seeded stage never touched the real job lifecycle
    let job = engine.submission.status(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}
