//! Conversation store semantics: purge-on-read, trimming, cleanup, stats.
use grokify_rs::store::{ConversationRow, ConversationStore};

const NOW: i64 = 1_700_000_000_000;

fn row(scope: &str, id: &str, hash: &str, token: &str, updated_at: i64, expires_at: i64) -> ConversationRow {
    ConversationRow {
        scope: scope.to_string(),
        openai_conversation_id: id.to_string(),
        grok_conversation_id: format!("grok-{id}"),
        last_response_id: format!("resp-{id}"),
        share_link_id: String::new(),
        token: token.to_string(),
        history_hash: hash.to_string(),
        created_at: updated_at,
        updated_at,
        expires_at,
    }
}

#[tokio::test]
async fn upsert_then_get_round_trips() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    let original = row("s1", "c1", "h1", "tok", NOW, NOW + 1000);
    store.upsert(&original).await.unwrap();

    let fetched = store.get_by_id("s1", "c1", NOW).await.unwrap().unwrap();
    assert_eq!(fetched, original);

    // Replacing by primary key updates mutable fields.
    let mut updated = original.clone();
    updated.last_response_id = "resp-new".to_string();
    updated.updated_at = NOW + 10;
    store.upsert(&updated).await.unwrap();
    let fetched = store.get_by_id("s1", "c1", NOW).await.unwrap().unwrap();
    assert_eq!(fetched.last_response_id, "resp-new");
}

#[tokio::test]
async fn get_by_id_never_returns_expired_rows() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    store
        .upsert(&row("s1", "c1", "h1", "tok", NOW, NOW + 1000))
        .await
        .unwrap();

    assert!(store.get_by_id("s1", "c1", NOW + 999).await.unwrap().is_some());
    // expires_at <= now is dead, and purged on the way.
    assert!(store.get_by_id("s1", "c1", NOW + 1000).await.unwrap().is_none());
    assert!(store.get_by_id("s1", "c1", NOW).await.unwrap().is_none());
}

#[tokio::test]
async fn history_hash_lookup_returns_newest_live_match() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    store
        .upsert(&row("s1", "old", "h1", "tok", NOW - 100, NOW + 1000))
        .await
        .unwrap();
    store
        .upsert(&row("s1", "new", "h1", "tok", NOW, NOW + 1000))
        .await
        .unwrap();
    // Same hash, other scope: must not leak across tenants.
    store
        .upsert(&row("s2", "other", "h1", "tok", NOW + 50, NOW + 1000))
        .await
        .unwrap();

    let found = store
        .find_by_history_hash("s1", "h1", NOW)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.openai_conversation_id, "new");

    assert!(store
        .find_by_history_hash("s1", "missing", NOW)
        .await
        .unwrap()
        .is_none());
    // The empty hash is reserved for "no history" and never matches.
    assert!(store
        .find_by_history_hash("s1", "", NOW)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn history_hash_lookup_purges_expired_scope_rows() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    store
        .upsert(&row("s1", "dead", "h1", "tok", NOW - 100, NOW - 1))
        .await
        .unwrap();

    assert!(store
        .find_by_history_hash("s1", "h1", NOW)
        .await
        .unwrap()
        .is_none());
    let stats = store.stats(5, NOW).await.unwrap();
    assert_eq!(stats.active_total + stats.expired_total, 0);
}

#[tokio::test]
async fn delete_by_id_removes_one_row() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    store
        .upsert(&row("s1", "c1", "h1", "tok", NOW, NOW + 1000))
        .await
        .unwrap();
    store.delete_by_id("s1", "c1").await.unwrap();
    assert!(store.get_by_id("s1", "c1", NOW).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_deletes_oldest_expired_first_with_clamped_limit() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    for i in 0..5i64 {
        store
            .upsert(&row(
                "s1",
                &format!("c{i}"),
                "h",
                "tok",
                NOW - 100,
                NOW - 10 + i,
            ))
            .await
            .unwrap();
    }
    store
        .upsert(&row("s1", "live", "h", "tok", NOW, NOW + 1000))
        .await
        .unwrap();

    // limit 0 clamps up to 1, removing the oldest expiry first.
    let deleted = store.cleanup_expired(0, NOW).await.unwrap();
    assert_eq!(deleted, 1);
    let deleted = store.cleanup_expired(500, NOW).await.unwrap();
    assert_eq!(deleted, 4);
    assert!(store.get_by_id("s1", "live", NOW).await.unwrap().is_some());
}

#[tokio::test]
async fn trim_keeps_most_recent_rows_per_token() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    for i in 0..6i64 {
        store
            .upsert(&row(
                "s1",
                &format!("c{i}"),
                "h",
                "tok-a",
                NOW + i,
                NOW + 100_000,
            ))
            .await
            .unwrap();
    }
    store
        .upsert(&row("s1", "other", "h", "tok-b", NOW, NOW + 100_000))
        .await
        .unwrap();

    let deleted = store.trim_for_token("s1", "tok-a", 2).await.unwrap();
    assert_eq!(deleted, 4);

    // The two newest survive; the other token is untouched.
    assert!(store.get_by_id("s1", "c5", NOW).await.unwrap().is_some());
    assert!(store.get_by_id("s1", "c4", NOW).await.unwrap().is_some());
    assert!(store.get_by_id("s1", "c0", NOW).await.unwrap().is_none());
    assert!(store.get_by_id("s1", "other", NOW).await.unwrap().is_some());
}

#[tokio::test]
async fn stats_reports_counts_and_token_suffixes() {
    let store = ConversationStore::connect_in_memory().await.unwrap();
    for i in 0..3i64 {
        store
            .upsert(&row(
                "s1",
                &format!("busy{i}"),
                "h",
                "fingerprint-abcdef",
                NOW,
                NOW + 1000,
            ))
            .await
            .unwrap();
    }
    store
        .upsert(&row("s1", "quiet", "h", "fingerprint-zzz999", NOW, NOW + 1000))
        .await
        .unwrap();
    store
        .upsert(&row("s1", "dead", "h", "fingerprint-abcdef", NOW, NOW - 1))
        .await
        .unwrap();

    let stats = store.stats(10, NOW).await.unwrap();
    assert_eq!(stats.active_total, 4);
    assert_eq!(stats.expired_total, 1);
    assert_eq!(stats.top_tokens[0].token_suffix, "abcdef");
    assert_eq!(stats.top_tokens[0].count, 3);
    assert_eq!(stats.top_tokens[1].token_suffix, "zzz999");
}
