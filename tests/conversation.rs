//! Conversation store coverage: sessions, per-agent message isolation, the
//! inter-agent mailbox, and the agent-deletion cascade (§4.6).

use goclaw_store::types::{MessageRole, TaskStatus, TaskType};
use goclaw_store::{OpContext, Store};
use serde_json::json;
use uuid::Uuid;

async fn new_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("goclaw.db")).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn upsert_session_is_idempotent() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();

    let a = store.upsert_session(&ctx, &session_id, Some("soul-1")).await.unwrap();
    let b = store.upsert_session(&ctx, &session_id, Some("soul-2")).await.unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(b.soul_hash.as_deref(), Some("soul-1"), "first write wins, no-op on conflict");
}

#[tokio::test]
async fn non_uuid_session_id_is_rejected() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    assert!(store.upsert_session(&ctx, "not-a-uuid", None).await.is_err());
}

#[tokio::test]
async fn messages_are_isolated_per_agent_within_a_session() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    store.append_message(&ctx, &session_id, "agent-a", MessageRole::User, "hi from a", 2).await.unwrap();
    store.append_message(&ctx, &session_id, "agent-b", MessageRole::User, "hi from b", 2).await.unwrap();

    let a_msgs = store.load_recent_messages(&ctx, &session_id, "agent-a", 10).await.unwrap();
    let b_msgs = store.load_recent_messages(&ctx, &session_id, "agent-b", 10).await.unwrap();
    assert_eq!(a_msgs.len(), 1);
    assert_eq!(b_msgs.len(), 1);
    assert_eq!(a_msgs[0].content, "hi from a");

    store.delete_messages_for_agent(&ctx, &session_id, "agent-a").await.unwrap();
    assert_eq!(store.count_messages(&ctx, &session_id, "agent-a").await.unwrap(), 0);
    assert_eq!(store.count_messages(&ctx, &session_id, "agent-b").await.unwrap(), 1, "deleting agent-a must not touch agent-b's rows");
}

#[tokio::test]
async fn recent_messages_come_back_oldest_first() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();

    for i in 0..5 {
        store
            .append_message(&ctx, &session_id, "agent-a", MessageRole::User, &format!("msg-{i}"), 1)
            .await
            .unwrap();
    }

    let recent = store.load_recent_messages(&ctx, &session_id, "agent-a", 3).await.unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["msg-2", "msg-3", "msg-4"]);

    let since = store.load_messages_since(&ctx, &session_id, "agent-a", recent[0].id, 10).await.unwrap();
    assert_eq!(since.len(), 2);
    assert_eq!(since[0].content, "msg-3");
}

#[tokio::test]
async fn mailbox_read_dequeues_transactionally_and_peek_is_non_destructive() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();

    store.mailbox_send(&ctx, "sender", "receiver", "one").await.unwrap();
    store.mailbox_send(&ctx, "sender", "receiver", "two").await.unwrap();
    store.mailbox_send(&ctx, "sender", "receiver", "three").await.unwrap();

    assert_eq!(store.mailbox_peek(&ctx, "receiver").await.unwrap(), 3);
    // Peeking must not consume anything.
    assert_eq!(store.mailbox_peek(&ctx, "receiver").await.unwrap(), 3);

    let batch = store.mailbox_read(&ctx, "receiver", 2).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["one", "two"]);
    assert!(batch.iter().all(|m| m.read_at.is_some()));

    assert_eq!(store.mailbox_peek(&ctx, "receiver").await.unwrap(), 1);
    let rest = store.mailbox_read(&ctx, "receiver", 10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].content, "three");

    // Nothing left for a third reader.
    assert!(store.mailbox_read(&ctx, "receiver", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn agent_lifecycle_and_status_updates() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();

    let agent = store.create_agent(&ctx, "agent-1", "Agent One", Some("anthropic"), Some("claude")).await.unwrap();
    assert_eq!(agent.status, goclaw_store::types::AgentStatus::Active);

    store.update_agent_status(&ctx, "agent-1", goclaw_store::types::AgentStatus::Draining).await.unwrap();
    let reloaded = store.get_agent(&ctx, "agent-1").await.unwrap().unwrap();
    assert_eq!(reloaded.status, goclaw_store::types::AgentStatus::Draining);

    let listed = store.list_agents(&ctx).await.unwrap();
    assert_eq!(listed.len(), 1);

    assert!(store.update_agent_status(&ctx, "no-such-agent", goclaw_store::types::AgentStatus::Stopped).await.is_err());
}

#[tokio::test]
async fn deleting_an_agent_cancels_queued_and_claimed_tasks_but_not_running_ones() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = Uuid::new_v4().to_string();
    store.upsert_session(&ctx, &session_id, None).await.unwrap();
    store.create_agent(&ctx, "agent-1", "Agent One", None, None).await.unwrap();

    let queued = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 0, 3, None)
        .await
        .unwrap();
    let to_claim = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 1, 3, None)
        .await
        .unwrap();
    let claimed = store.claim_task(&ctx, Some("agent-1")).await.unwrap().unwrap();
    assert_eq!(claimed.id, to_claim.id);

    let running_task = store
        .create_task(&ctx, &session_id, "agent-1", TaskType::Chat, json!({}), 2, 3, None)
        .await
        .unwrap();
    let claimed2 = store.claim_task(&ctx, Some("agent-1")).await.unwrap().unwrap();
    assert_eq!(claimed2.id, running_task.id);
    store.start_run(&ctx, &running_task.id, &claimed2.lease_owner.unwrap(), "v1").await.unwrap();

    store.mailbox_send(&ctx, "agent-1", "agent-2", "hi").await.unwrap();
    store.mailbox_send(&ctx, "agent-2", "agent-1", "hi back").await.unwrap();

    store.delete_agent(&ctx, "agent-1").await.unwrap();

    assert_eq!(store.get_agent(&ctx, "agent-1").await.unwrap(), None);
    assert_eq!(store.get_task(&ctx, &queued.id).await.unwrap().unwrap().status, TaskStatus::Canceled);
    assert_eq!(store.get_task(&ctx, &claimed.id).await.unwrap().unwrap().status, TaskStatus::Canceled);
    assert_eq!(
        store.get_task(&ctx, &running_task.id).await.unwrap().unwrap().status,
        TaskStatus::Running,
        "a RUNNING task belonging to a deleted agent is left for the engine's drain path"
    );
    assert_eq!(store.mailbox_peek(&ctx, "agent-2").await.unwrap(), 0, "mailbox rows touching the deleted agent are gone");
}
