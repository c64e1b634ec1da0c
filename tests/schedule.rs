//! Cron-style schedule bookkeeping: due-polling, firing, enable/disable,
//! deletion.

use chrono::{Duration, Utc};
use goclaw_store::{OpContext, Store};
use uuid::Uuid;

async fn new_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("goclaw.db")).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn due_schedules_only_returns_enabled_and_past_due_ones() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let past_due = store
        .create_schedule(&ctx, "*/5 * * * *", &session_id, Utc::now() - Duration::minutes(1))
        .await
        .unwrap();
    let not_yet = store
        .create_schedule(&ctx, "0 0 * * *", &session_id, Utc::now() + Duration::hours(1))
        .await
        .unwrap();

    let due = store.due_schedules(&ctx).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, past_due.id);

    store.set_schedule_enabled(&ctx, &past_due.id, false).await.unwrap();
    assert!(store.due_schedules(&ctx).await.unwrap().is_empty());

    store.set_schedule_enabled(&ctx, &past_due.id, true).await.unwrap();
    assert_eq!(store.due_schedules(&ctx).await.unwrap().len(), 1);

    let _ = not_yet;
}

#[tokio::test]
async fn firing_a_schedule_stamps_last_run_and_advances_next_run() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let schedule = store
        .create_schedule(&ctx, "*/5 * * * *", &session_id, Utc::now() - Duration::minutes(1))
        .await
        .unwrap();
    assert!(schedule.last_run_at.is_none());

    let next = Utc::now() + Duration::minutes(5);
    store.mark_schedule_fired(&ctx, &schedule.id, Some(next)).await.unwrap();

    let reloaded = store.get_schedule(&ctx, &schedule.id).await.unwrap().unwrap();
    assert!(reloaded.last_run_at.is_some());
    assert!(reloaded.next_run_at.unwrap() > Utc::now());

    // A one-shot schedule clears next_run_at by passing None, removing it from the due poll.
    store.mark_schedule_fired(&ctx, &schedule.id, None).await.unwrap();
    assert!(store.due_schedules(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_schedule_removes_it() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    let schedule = store
        .create_schedule(&ctx, "0 0 * * *", &session_id, Utc::now())
        .await
        .unwrap();
    store.delete_schedule(&ctx, &schedule.id).await.unwrap();
    assert!(store.get_schedule(&ctx, &schedule.id).await.unwrap().is_none());
    assert!(store.delete_schedule(&ctx, &schedule.id).await.is_err());
}
