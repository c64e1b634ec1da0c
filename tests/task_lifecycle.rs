//! End-to-end coverage of the task lattice: happy path, claim races, lease
//! expiry, cancellation, and crash recovery.

use goclaw_store::{OpContext, Store};
use goclaw_store::types::{TaskStatus, TaskType};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

async fn new_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("goclaw.db")).await.unwrap();
    (store, dir)
}

async fn seeded_session(store: &Store, ctx: &OpContext) -> String {
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(ctx, &session_id, None).await.unwrap();
    session_id
}

#[tokio::test]
async fn single_task_happy_path() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = seeded_session(&store, &ctx).await;

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({"q": "hi"}), 0, 3, None)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempt, 0);

    let claimed = store.claim_task(&ctx, None).await.unwrap().expect("a claimable task");
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, TaskStatus::Claimed);
    let lease_owner = claimed.lease_owner.clone().expect("claim sets a lease owner");

    let running = store
        .start_run(&ctx, &task.id, &lease_owner, "v1")
        .await
        .unwrap();
    assert_eq!(running.status, TaskStatus::Running);

    let completed = store
        .complete_task(&ctx, &task.id, json!({"answer": 42}), 128, 0.002)
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Succeeded);
    assert_eq!(completed.result, Some(json!({"answer": 42})));
    assert!(completed.lease_owner.is_none());

    let bounds = store.event_id_bounds(&ctx, &session_id).await.unwrap().unwrap();
    let events = store.events_from(&ctx, &session_id, bounds.0 - 1, 100).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["task.enqueued", "task.claimed", "task.started", "task.completed"]
    );
}

#[tokio::test]
async fn concurrent_claim_never_double_assigns() {
    let (store, _dir) = new_store().await;
    let store = Arc::new(store);
    let ctx = OpContext::new();
    let session_id = seeded_session(&store, &ctx).await;

    store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move { store.claim_task(&ctx, None).await.unwrap() }));
    }

    let mut winners = 0;
    for h in handles {
        if h.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent claimant should win the only task");
}

#[tokio::test]
async fn fresh_lease_is_not_expired_but_heartbeat_extends_it() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = seeded_session(&store, &ctx).await;

    store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();
    let claimed = store.claim_task(&ctx, None).await.unwrap().unwrap();

    let requeued = store.expire_leases(&ctx).await.unwrap();
    assert_eq!(requeued, 0, "a freshly claimed task's lease has not expired yet");

    let lease_owner = claimed.lease_owner.unwrap();
    let hb = store.heartbeat(&ctx, &claimed.id, &lease_owner).await.unwrap();
    assert!(hb, "heartbeat should succeed while the lease is held");
    assert!(
        !store.heartbeat(&ctx, &claimed.id, "someone-elses-lease").await.unwrap(),
        "heartbeat must not extend a lease the caller doesn't hold"
    );
}

#[tokio::test]
async fn expired_lease_is_requeued_by_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let config = goclaw_store::StoreConfig {
        db_path: dir.path().join("goclaw.db"),
        lease_duration_secs: 1,
        ..goclaw_store::StoreConfig::default()
    };
    let store = Store::open_with_config(config).await.unwrap();
    let ctx = OpContext::new();
    let session_id = seeded_session(&store, &ctx).await;

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();
    store.claim_task(&ctx, None).await.unwrap().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let requeued = store.expire_leases(&ctx).await.unwrap();
    assert_eq!(requeued, 1);
    let after = store.get_task(&ctx, &task.id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Queued);
    assert!(after.lease_owner.is_none());
    assert!(after.lease_expires_at.is_none());
}

#[tokio::test]
async fn cancel_requested_flag_is_cooperative_until_abort() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = seeded_session(&store, &ctx).await;

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();

    store.request_cancel(&ctx, &task.id).await.unwrap();
    assert!(store.is_cancel_requested(&ctx, &task.id).await.unwrap());

    // Cooperative cancellation alone does not change status.
    let still_queued = store.get_task(&ctx, &task.id).await.unwrap().unwrap();
    assert_eq!(still_queued.status, TaskStatus::Queued);

    let aborted = store.abort_task(&ctx, &task.id).await.unwrap();
    assert!(aborted);
    let final_task = store.get_task(&ctx, &task.id).await.unwrap().unwrap();
    assert_eq!(final_task.status, TaskStatus::Canceled);
    assert_eq!(final_task.last_error_code.as_deref(), Some("ABORTED"));
}

#[tokio::test]
async fn recover_on_startup_requeues_stale_tasks_and_scrubs_partial_output() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = seeded_session(&store, &ctx).await;

    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();
    let claimed = store.claim_task(&ctx, None).await.unwrap().unwrap();
    let lease_owner = claimed.lease_owner.clone().unwrap();
    store.start_run(&ctx, &task.id, &lease_owner, "v1").await.unwrap();

    // Simulate a half-written assistant reply left behind by the crashed run.
    store
        .append_message(&ctx, &session_id, "agent-1", goclaw_store::types::MessageRole::Assistant, "partial...", 3)
        .await
        .unwrap();

    let metrics = store.recover_on_startup(&ctx).await.unwrap();
    assert_eq!(metrics.stale_count, 1);

    let recovered = store.get_task(&ctx, &task.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Queued);
    assert!(recovered.lease_owner.is_none());

    let remaining = store.count_messages(&ctx, &session_id, "agent-1").await.unwrap();
    assert_eq!(remaining, 0, "partial assistant output from the crashed run should be scrubbed");
}
