//! Coverage of the best-effort event-publisher hook (§4.10): confirms each
//! task/plan operation that should fire a notification does, and that
//! everything still works with no publisher attached.

use goclaw_store::publisher::{topics, EventPublisher};
use goclaw_store::types::TaskType;
use goclaw_store::{OpContext, Store};
use serde_json::json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        self.events.lock().unwrap().push((topic.to_string(), payload));
    }
}

impl RecordingPublisher {
    fn topics(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

async fn new_store_with_recorder() -> (Store, Arc<RecordingPublisher>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(RecordingPublisher::default());
    let store = Store::open(dir.path().join("goclaw.db"))
        .await
        .unwrap()
        .with_publisher(recorder.clone());
    (store, recorder, dir)
}

#[tokio::test]
async fn completing_a_task_publishes_task_completed() {
    let (store, recorder, _dir) = new_store_with_recorder().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();
    let claimed = store.claim_task(&ctx, None).await.unwrap().unwrap();
    store.start_run(&ctx, &task.id, &claimed.lease_owner.unwrap(), "v1").await.unwrap();
    store.complete_task(&ctx, &task.id, json!({"ok": true}), 10, 0.0).await.unwrap();

    assert_eq!(
        recorder.topics(),
        vec![topics::TASK_METRICS.to_string(), topics::TASK_COMPLETED.to_string()],
        "the metrics snapshot is recorded before the terminal task.completed notification"
    );
}

#[tokio::test]
async fn dead_lettering_a_task_publishes_task_failed_but_ordinary_retries_do_not() {
    let (store, recorder, _dir) = new_store_with_recorder().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 1, None)
        .await
        .unwrap();
    let claimed = store.claim_task(&ctx, None).await.unwrap().unwrap();
    store.start_run(&ctx, &task.id, &claimed.lease_owner.unwrap(), "v1").await.unwrap();

    let decision = store.fail_task(&ctx, &task.id, "fatal").await.unwrap();
    assert_eq!(decision.outcome, goclaw_store::tasks::FailOutcome::DeadLetter);

    assert_eq!(
        recorder.topics(),
        vec![topics::TASK_METRICS.to_string(), topics::TASK_FAILED.to_string()],
        "a retry would not publish anything; only the terminal dead-letter snapshots metrics and publishes task.failed"
    );
}

#[tokio::test]
async fn aborting_a_task_publishes_task_canceled() {
    let (store, recorder, _dir) = new_store_with_recorder().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();
    store.abort_task(&ctx, &task.id).await.unwrap();

    assert_eq!(recorder.topics(), vec![topics::TASK_CANCELED.to_string()]);
}

#[tokio::test]
async fn plan_execution_lifecycle_publishes_started_step_completed_and_finished() {
    let (store, recorder, _dir) = new_store_with_recorder().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let execution = store.start_plan_execution(&ctx, "plan-1", &session_id).await.unwrap();
    let step = store.add_plan_step(&ctx, &execution.id, 0, "fetch").await.unwrap();
    store.complete_plan_step(&ctx, &step.id, "SUCCEEDED", None).await.unwrap();
    store.finish_plan_execution(&ctx, &execution.id, "SUCCEEDED").await.unwrap();

    assert_eq!(
        recorder.topics(),
        vec![
            topics::PLAN_EXECUTION_STARTED.to_string(),
            topics::PLAN_STEP_COMPLETED.to_string(),
            topics::PLAN_EXECUTION_COMPLETED.to_string(),
        ]
    );
}

#[tokio::test]
async fn streaming_token_usage_to_a_running_task_publishes_task_tokens() {
    let (store, recorder, _dir) = new_store_with_recorder().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();

    // Claimed, not yet running: an interim usage update has nothing to land on.
    let claimed = store.claim_task(&ctx, None).await.unwrap().unwrap();
    let updated = store.update_token_usage(&ctx, &task.id, 42).await.unwrap();
    assert!(!updated, "a claimed-but-not-running task has no usage to stream yet");
    assert!(recorder.topics().is_empty());

    store.start_run(&ctx, &task.id, &claimed.lease_owner.unwrap(), "v1").await.unwrap();
    let updated = store.update_token_usage(&ctx, &task.id, 42).await.unwrap();
    assert!(updated);
    assert_eq!(recorder.topics(), vec![topics::TASK_TOKENS.to_string()]);
}

#[tokio::test]
async fn without_a_publisher_attached_operations_still_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("goclaw.db")).await.unwrap();
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();
    let claimed = store.claim_task(&ctx, None).await.unwrap().unwrap();
    store.start_run(&ctx, &task.id, &claimed.lease_owner.unwrap(), "v1").await.unwrap();
    let completed = store.complete_task(&ctx, &task.id, json!({}), 0, 0.0).await.unwrap();
    assert_eq!(completed.status, goclaw_store::types::TaskStatus::Succeeded);
}
