//! Skill registry: registration idempotence and the fault-quarantine
//! threshold.

use goclaw_store::skills::SkillState;
use goclaw_store::{OpContext, Store};

async fn new_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("goclaw.db")).await.unwrap();
    (store, dir)
}

#[tokio::test]
async fn registering_the_same_hash_twice_is_a_no_op() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();

    let first = store.register_skill(&ctx, "hash-1", "web-search", Some("marketplace")).await.unwrap();
    assert_eq!(first.state, SkillState::Active);
    assert_eq!(first.fault_count, 0);

    // Re-registering must not reset fault_count or touch existing state.
    store.record_skill_fault(&ctx, "hash-1").await.unwrap();
    let second = store.register_skill(&ctx, "hash-1", "web-search", Some("marketplace")).await.unwrap();
    assert_eq!(second.fault_count, 1, "ON CONFLICT DO NOTHING must not reset the fault counter");
}

#[tokio::test]
async fn a_skill_is_quarantined_after_the_third_fault() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    store.register_skill(&ctx, "hash-1", "flaky-tool", None).await.unwrap();

    assert_eq!(store.record_skill_fault(&ctx, "hash-1").await.unwrap(), SkillState::Active);
    assert_eq!(store.record_skill_fault(&ctx, "hash-1").await.unwrap(), SkillState::Active);
    assert_eq!(store.record_skill_fault(&ctx, "hash-1").await.unwrap(), SkillState::Quarantined);

    let active = store.list_active_skills(&ctx).await.unwrap();
    assert!(active.is_empty());

    let skill = store.get_skill(&ctx, "hash-1").await.unwrap().unwrap();
    assert_eq!(skill.fault_count, 3);
    assert_eq!(skill.state, SkillState::Quarantined);
}

#[tokio::test]
async fn list_active_skills_excludes_quarantined_ones() {
    let (store, _dir) = new_store().await;
    let ctx = OpContext::new();
    store.register_skill(&ctx, "hash-good", "good-tool", None).await.unwrap();
    store.register_skill(&ctx, "hash-bad", "bad-tool", None).await.unwrap();
    for _ in 0..3 {
        store.record_skill_fault(&ctx, "hash-bad").await.unwrap();
    }

    let active = store.list_active_skills(&ctx).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].skill_hash, "hash-good");
}
