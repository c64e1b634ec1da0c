//! Operational maintenance coverage: retention windows, PII purge, and
//! file-based backups (§4.8).

use goclaw_store::types::{MessageRole, TaskType};
use goclaw_store::{OpContext, Store};
use serde_json::json;
use uuid::Uuid;

async fn new_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("goclaw.db")).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn zero_days_disables_a_retention_category() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();
    store.append_message(&ctx, &session_id, "agent-1", MessageRole::User, "hi", 1).await.unwrap();

    // Every window disabled: nothing should be touched even though rows exist.
    let report = store.run_retention(&ctx, 0, 0, 0).await.unwrap();
    assert_eq!(report.task_events_deleted, 0);
    assert_eq!(report.audit_log_deleted, 0);
    assert_eq!(report.messages_deleted, 0);
    assert_eq!(report.mailbox_deleted, 0);
    assert_eq!(store.count_messages(&ctx, &session_id, "agent-1").await.unwrap(), 1);
}

#[tokio::test]
async fn positive_retention_window_leaves_fresh_rows_alone() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();
    store.append_message(&ctx, &session_id, "agent-1", MessageRole::User, "hi", 1).await.unwrap();

    // A 30-day window can't possibly touch a message created moments ago.
    let report = store.run_retention(&ctx, 30, 30, 30).await.unwrap();
    assert_eq!(report.messages_deleted, 0);
    assert_eq!(store.count_messages(&ctx, &session_id, "agent-1").await.unwrap(), 1);
}

#[tokio::test]
async fn retention_only_purges_read_mailbox_messages() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    store.mailbox_send(&ctx, "a", "b", "unread forever").await.unwrap();
    let report = store.run_retention(&ctx, 0, 0, 30).await.unwrap();
    assert_eq!(report.mailbox_deleted, 0, "unread mail is never swept regardless of age");
    assert_eq!(store.mailbox_peek(&ctx, "b").await.unwrap(), 1);
}

#[tokio::test]
async fn purge_session_pii_tombstones_tasks_events_and_messages() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();
    store.append_message(&ctx, &session_id, "agent-1", MessageRole::User, "my ssn is 123-45-6789", 6).await.unwrap();
    store.append_message(&ctx, &session_id, "agent-1", MessageRole::Assistant, "noted", 1).await.unwrap();

    // A single-attempt task that fails goes straight to dead-letter via two
    // chained transitions (Running->Failed, Failed->DeadLetter), each
    // stamping a `reason` payload onto its own event row — giving purge
    // something in task_events to actually tombstone.
    let task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({"ssn": "123-45-6789"}), 0, 1, None)
        .await
        .unwrap();
    let claimed = store.claim_task(&ctx, None).await.unwrap().unwrap();
    store.start_run(&ctx, &task.id, &claimed.lease_owner.unwrap(), "v1").await.unwrap();
    store.fail_task(&ctx, &task.id, "leaked ssn 123-45-6789 upstream").await.unwrap();

    let report = store.purge_session_pii(&ctx, &session_id, Some("v3"), "operator").await.unwrap();
    assert_eq!(report.messages_deleted, 2);
    assert_eq!(report.tasks_tombstoned, 1);
    assert_eq!(report.events_tombstoned, 2, "both the failed and dead-lettered transition events carried a reason payload");
    assert_eq!(report.redactions_recorded, 4, "one for the session, one for the task, two for the events");

    assert_eq!(store.count_messages(&ctx, &session_id, "agent-1").await.unwrap(), 0);
    let purged_task = store.get_task(&ctx, &task.id).await.unwrap().unwrap();
    assert_eq!(purged_task.payload, json!("[REDACTED]"));
    assert_eq!(purged_task.result, Some(json!("[REDACTED]")));
}

#[tokio::test]
async fn purging_a_session_with_no_pii_is_a_clean_no_op() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let report = store.purge_session_pii(&ctx, &session_id, None, "operator").await.unwrap();
    assert_eq!(report.messages_deleted, 0);
    assert_eq!(report.tasks_tombstoned, 0);
    assert_eq!(report.events_tombstoned, 0);
    assert_eq!(report.redactions_recorded, 0);
}

#[tokio::test]
async fn backup_writes_a_snapshot_and_refuses_to_overwrite() {
    let (store, dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let dest = dir.path().join("snapshot.db");
    store.backup(&ctx, &dest).await.unwrap();
    assert!(dest.exists());

    let result = store.backup(&ctx, &dest).await;
    assert!(matches!(result, Err(goclaw_store::StoreError::Conflict { .. })));
}
