//! Knowledge store coverage: memory relevance decay, pins, cross-agent
//! shares (including wildcards), summaries, and reasoning-loop checkpoints.

use goclaw_store::knowledge::ShareType;
use goclaw_store::{OpContext, Store};
use serde_json::json;

async fn new_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("goclaw.db")).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn upsert_resets_relevance_and_touch_nudges_it_up() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();

    let mem = store.upsert_memory(&ctx, "agent-1", "likes", "rust", None).await.unwrap();
    assert_eq!(mem.relevance, 1.0);

    store.decay_memories(&ctx, "agent-1", 0.5).await.unwrap();
    let decayed = store.search_memories(&ctx, "agent-1", "likes", 10).await.unwrap();
    assert_eq!(decayed[0].relevance, 0.5);

    store.touch_memory(&ctx, "agent-1", "likes").await.unwrap();
    let touched = store.search_memories(&ctx, "agent-1", "likes", 10).await.unwrap();
    assert!((touched[0].relevance - 0.55).abs() < 1e-9);
    assert_eq!(touched[0].access_count, 1);

    // Re-upserting resets relevance to 1.0 regardless of prior decay.
    let refreshed = store.upsert_memory(&ctx, "agent-1", "likes", "rust and go", None).await.unwrap();
    assert_eq!(refreshed.relevance, 1.0);
    assert_eq!(refreshed.value, "rust and go");
}

#[tokio::test]
async fn touch_relevance_clamps_at_one() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    store.upsert_memory(&ctx, "agent-1", "k", "v", None).await.unwrap();
    for _ in 0..20 {
        store.touch_memory(&ctx, "agent-1", "k").await.unwrap();
    }
    let mem = store.search_memories(&ctx, "agent-1", "k", 10).await.unwrap();
    assert_eq!(mem[0].relevance, 1.0);
}

#[tokio::test]
async fn search_memories_matches_substrings_in_key_or_value() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    store.upsert_memory(&ctx, "agent-1", "favorite_lang", "rust", None).await.unwrap();
    store.upsert_memory(&ctx, "agent-2", "timezone", "UTC", None).await.unwrap();
    let results = store.search_memories(&ctx, "agent-1", "rust", 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key, "favorite_lang");
}

#[tokio::test]
async fn pins_are_visible_to_owner_directly_shared_and_wildcard_shared_agents() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();

    store.upsert_pin(&ctx, "agent-1", "file://notes.md", "some notes content", true, None).await.unwrap();
    store.upsert_pin(&ctx, "agent-1", "file://private.md", "secret", false, None).await.unwrap();

    // Nothing shared yet: agent-2 sees nothing.
    assert!(store.list_visible_pins(&ctx, "agent-2").await.unwrap().is_empty());

    store.grant_share(&ctx, "agent-1", "agent-2", ShareType::Pin, "file://notes.md").await.unwrap();
    let visible = store.list_visible_pins(&ctx, "agent-2").await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].source, "file://notes.md");

    assert!(store.is_pin_shared(&ctx, "agent-1", "agent-2", "file://notes.md").await.unwrap());
    assert!(!store.is_pin_shared(&ctx, "agent-1", "agent-2", "file://private.md").await.unwrap());

    // Wildcard target makes it visible to any agent.
    store.upsert_pin(&ctx, "agent-1", "file://readme.md", "readme", true, None).await.unwrap();
    store.grant_share(&ctx, "agent-1", "*", ShareType::Pin, "file://readme.md").await.unwrap();
    assert!(store.is_pin_shared(&ctx, "agent-1", "agent-99", "file://readme.md").await.unwrap());

    // Owner always sees their own pins, including unshared ones.
    let own = store.list_visible_pins(&ctx, "agent-1").await.unwrap();
    assert_eq!(own.len(), 3);
}

#[tokio::test]
async fn share_type_all_covers_both_memory_and_pin_wildcards() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    store.grant_share(&ctx, "agent-1", "agent-2", ShareType::All, "*").await.unwrap();
    assert!(store.is_memory_shared(&ctx, "agent-1", "agent-2", "anything").await.unwrap());
    assert!(store.is_pin_shared(&ctx, "agent-1", "agent-2", "file://anything.md").await.unwrap());
    assert!(!store.is_memory_shared(&ctx, "agent-1", "agent-3", "anything").await.unwrap());
}

#[tokio::test]
async fn summaries_and_checkpoints_round_trip() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    let session_id = "session-1";

    assert!(store.get_summary(&ctx, session_id, "agent-1").await.unwrap().is_none());
    store.upsert_summary(&ctx, session_id, "agent-1", "first summary").await.unwrap();
    store.upsert_summary(&ctx, session_id, "agent-1", "second summary").await.unwrap();
    let summary = store.get_summary(&ctx, session_id, "agent-1").await.unwrap().unwrap();
    assert_eq!(summary.content, "second summary");

    let messages = json!([{"role": "user", "content": "hi"}]);
    store.save_checkpoint(&ctx, "agent-1", session_id, 3, 500, "running", &messages).await.unwrap();
    let checkpoint = store.load_checkpoint(&ctx, "agent-1", session_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.step, 3);
    assert_eq!(checkpoint.messages, messages);

    // A finished loop's checkpoint on a different agent, which is what
    // cleanup is actually meant to sweep.
    store.save_checkpoint(&ctx, "agent-2", session_id, 9, 999, "completed", &messages).await.unwrap();

    let cleaned = store.cleanup_checkpoints(&ctx, chrono::Duration::seconds(-1)).await.unwrap();
    assert_eq!(cleaned, 1, "only the completed checkpoint is swept; a running one is never deleted");
    assert!(store.load_checkpoint(&ctx, "agent-1", session_id).await.unwrap().is_some(), "running checkpoint must survive cleanup");
    assert!(store.load_checkpoint(&ctx, "agent-2", session_id).await.unwrap().is_none());
}
