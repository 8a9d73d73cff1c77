//! Multi-client session scenarios over the in-process bus and store.
//!
//! Every test runs on paused tokio time, so debounce windows, cursor
//! intervals and heartbeats advance deterministically.

use std::sync::Arc;

use codepair_sync::protocol::{BroadcastMessage, CursorPosition, Identity};
use codepair_sync::{
    Language, MemoryBus, MemoryStore, SessionHandle, SessionLifecycle, SessionPhase, SyncConfig, SyncError,
};
use tokio::time::Duration;
use uuid::Uuid;

fn client(name: &str, bus: &MemoryBus, store: &MemoryStore) -> SessionLifecycle {
    SessionLifecycle::new(
        Identity::new(Uuid::new_v4(), name),
        Arc::new(bus.clone()),
        Arc::new(store.clone()),
        SyncConfig::for_testing(),
    )
}

fn handle(lifecycle: &mut SessionLifecycle) -> &mut SessionHandle {
    lifecycle.session_mut().expect("client should be in a session")
}

/// Let forwarding tasks and pumps drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// A creates a session in `language`, B joins it. Returns (A, B, channel, session id).
async fn pair(
    bus: &MemoryBus,
    store: &MemoryStore,
    language: Language,
) -> (SessionLifecycle, SessionLifecycle, String, Uuid) {
    let mut alice = client("alice", bus, store);
    let created = alice.create(language).await.unwrap();
    let (code, channel, session_id) = (
        created.join_code().to_string(),
        created.channel().to_string(),
        created.session_id(),
    );

    let mut bob = client("bob", bus, store);
    bob.join(&code).await.unwrap();
    settle().await;
    (alice, bob, channel, session_id)
}

fn code_updates(bus: &MemoryBus, channel: &str) -> Vec<BroadcastMessage> {
    bus.published(channel)
        .into_iter()
        .filter(|m| matches!(m, BroadcastMessage::CodeUpdate { .. }))
        .collect()
}

fn cursor_updates(bus: &MemoryBus, channel: &str) -> Vec<CursorPosition> {
    bus.published(channel)
        .into_iter()
        .filter_map(|m| match m {
            BroadcastMessage::CursorUpdate { position, .. } => Some(position),
            _ => None,
        })
        .collect()
}

// ─── Propagation ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_edit_and_language_reach_peer() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, _channel, session_id) = pair(&bus, &store, Language::Python).await;
    assert_eq!(handle(&mut bob).language(), Language::Python);

    handle(&mut alice).edit_document("print(1)").await.unwrap();
    settle().await;
    assert_eq!(handle(&mut bob).content(), "print(1)");

    handle(&mut alice).set_language(Language::Cpp).await.unwrap();
    settle().await;
    assert_eq!(handle(&mut bob).language(), Language::Cpp);
    assert_eq!(store.language_writes(session_id).await, vec![Language::Cpp]);
    assert_eq!(store.session(session_id).await.unwrap().language, Language::Cpp);
}

#[tokio::test(start_paused = true)]
async fn test_one_edit_one_broadcast() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, channel, _) = pair(&bus, &store, Language::Cpp).await;
    let bob_id = bob.identity().user_id;

    handle(&mut alice).edit_document("int main() {}").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let updates = code_updates(&bus, &channel);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].origin_id(), alice.identity().user_id);
    // B applied it without sending anything back.
    assert_eq!(bus.published_by(bob_id), 0);
    assert_eq!(handle(&mut bob).stats().remote_updates_applied, 1);
    assert_eq!(handle(&mut bob).stats().broadcasts_sent, 0);
    assert_eq!(handle(&mut alice).stats().broadcasts_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_guest_language_change_not_persisted() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, _, session_id) = pair(&bus, &store, Language::Python).await;

    handle(&mut bob).set_language(Language::Java).await.unwrap();
    settle().await;
    assert_eq!(handle(&mut alice).language(), Language::Java);
    assert!(store.language_writes(session_id).await.is_empty());
    assert_eq!(store.session(session_id).await.unwrap().language, Language::Python);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_edit_is_not_broadcast() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, _bob, channel, _) = pair(&bus, &store, Language::Cpp).await;

    handle(&mut alice).edit_document("same").await.unwrap();
    handle(&mut alice).edit_document("same").await.unwrap();
    handle(&mut alice).set_language(Language::Cpp).await.unwrap();
    settle().await;
    assert_eq!(bus.published(&channel).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_edit_survives_bus_outage() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, _bob, _, session_id) = pair(&bus, &store, Language::Cpp).await;

    bus.set_offline(true);
    handle(&mut alice).edit_document("offline work").await.unwrap();
    assert_eq!(handle(&mut alice).content(), "offline work");
    assert_eq!(handle(&mut alice).stats().broadcasts_sent, 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.session(session_id).await.unwrap().document_content, "offline work");
}

// ─── Persistence ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_edit_burst_persists_once() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, _bob, _, session_id) = pair(&bus, &store, Language::Python).await;

    for i in 0..8 {
        handle(&mut alice).edit_document(format!("x = {i}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(handle(&mut alice).has_pending_write());
    assert!(store.document_writes(session_id).await.is_empty());

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let writes = store.document_writes(session_id).await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].content, "x = 7");
    assert!(!handle(&mut alice).has_pending_write());
    assert_eq!(handle(&mut alice).stats().durable_writes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_receiver_does_not_write() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, _, session_id) = pair(&bus, &store, Language::Python).await;

    handle(&mut alice).edit_document("only alice saves").await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(store.document_writes(session_id).await.len(), 1);
    assert_eq!(handle(&mut bob).stats().durable_writes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_last_timer_to_fire_wins() {
    for alice_last in [false, true] {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let (mut alice, mut bob, _, session_id) = pair(&bus, &store, Language::Python).await;

        // Partitioned: each side keeps its own content.
        bus.set_offline(true);
        let (first, second) = if alice_last {
            (&mut bob, &mut alice)
        } else {
            (&mut alice, &mut bob)
        };
        handle(first).edit_document("first").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle(second).edit_document("second").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let writes = store.document_writes(session_id).await;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].content, "first");
        assert_eq!(writes[1].content, "second");
        assert_eq!(store.session(session_id).await.unwrap().document_content, "second");
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_keeps_local_state() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, _bob, _, session_id) = pair(&bus, &store, Language::Python).await;
    store.set_fail_writes(true);

    handle(&mut alice).edit_document("draft").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(handle(&mut alice).stats().failed_writes, 1);
    assert_eq!(handle(&mut alice).content(), "draft");

    // The next debounce cycle writes again.
    store.set_fail_writes(false);
    handle(&mut alice).edit_document("draft 2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.session(session_id).await.unwrap().document_content, "draft 2");
}

// ─── Cursors and presence ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cursor_burst_sends_last_sample() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, channel, _) = pair(&bus, &store, Language::Cpp).await;
    let alice_id = alice.identity().user_id;

    for i in 0..6 {
        handle(&mut alice).move_cursor(CursorPosition::new(i as f32, 2.0 * i as f32)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cursor_updates(&bus, &channel), vec![CursorPosition::new(5.0, 10.0)]);
    let seen = handle(&mut bob).participant(alice_id).unwrap();
    assert_eq!(seen.cursor_position, Some(CursorPosition::new(5.0, 10.0)));
    assert_eq!(handle(&mut alice).last_cursor(), Some(CursorPosition::new(5.0, 10.0)));
}

#[tokio::test(start_paused = true)]
async fn test_presence_tracks_join_and_leave() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, _, _) = pair(&bus, &store, Language::Cpp).await;
    let bob_id = bob.identity().user_id;

    let names: Vec<String> = handle(&mut alice)
        .participants()
        .into_iter()
        .map(|p| p.display_name)
        .collect();
    assert_eq!(names, vec!["alice", "bob"]);
    let seen_by_alice = handle(&mut alice).participant(bob_id).unwrap();
    let seen_by_bob = handle(&mut bob).participant(bob_id).unwrap();
    assert_eq!(seen_by_alice.color, seen_by_bob.color);

    bob.leave().await;
    settle().await;
    assert_eq!(handle(&mut alice).participants().len(), 1);
    assert!(handle(&mut alice).participant(bob_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_refreshes_presence() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (alice, _bob, _, _) = pair(&bus, &store, Language::Cpp).await;
    let alice_id = alice.identity().user_id;
    let before = bus.track_count(alice_id);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(bus.track_count(alice_id), before + 3);
}

// ─── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unknown_code_is_not_found() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let mut alice = client("alice", &bus, &store);
    let session_id = alice.create(Language::Cpp).await.unwrap().session_id();

    let mut bob = client("bob", &bus, &store);
    let err = bob.join("zzzzzz").await.err().unwrap();
    assert!(matches!(err, SyncError::NotFound(code) if code == "ZZZZZZ"));
    assert_eq!(bob.phase(), SessionPhase::Idle);
    assert_eq!(store.session_count().await, 1);
    assert_eq!(store.participants(session_id).await, vec![alice.identity().user_id]);
    assert_eq!(bus.track_count(bob.identity().user_id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_leave_cancels_pending_work() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, _bob, channel, session_id) = pair(&bus, &store, Language::Cpp).await;
    let alice_id = alice.identity().user_id;

    handle(&mut alice).edit_document("unsaved").await.unwrap();
    handle(&mut alice).move_cursor(CursorPosition::new(1.0, 1.0)).unwrap();
    let published = bus.published_by(alice_id);
    let tracked = bus.track_count(alice_id);

    alice.leave().await;
    assert_eq!(alice.phase(), SessionPhase::Idle);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(bus.published_by(alice_id), published);
    assert_eq!(bus.track_count(alice_id), tracked);
    assert!(store.document_writes(session_id).await.is_empty());
    assert!(cursor_updates(&bus, &channel).is_empty());
    assert!(bus.presence(&channel).await.iter().all(|p| p.user_id != alice_id));
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_leave_loads_persisted_content() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, _, _) = pair(&bus, &store, Language::Python).await;
    let code = handle(&mut alice).join_code().to_string();

    handle(&mut alice).edit_document("saved").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    alice.leave().await;
    bob.leave().await;

    let mut carol = client("carol", &bus, &store);
    carol.join(&code).await.unwrap();
    assert_eq!(handle(&mut carol).content(), "saved");
}

// ─── Bus disruption ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_resubscribe_after_drop() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, mut bob, _, _) = pair(&bus, &store, Language::Cpp).await;

    assert_eq!(bus.disconnect_all().await, 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.phase(), SessionPhase::Active);
    assert_eq!(bob.phase(), SessionPhase::Active);
    assert_eq!(handle(&mut bob).stats().reconnects, 1);

    handle(&mut alice).edit_document("after reconnect").await.unwrap();
    settle().await;
    assert_eq!(handle(&mut bob).content(), "after reconnect");
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_backoff() {
    let (bus, store) = (MemoryBus::default(), MemoryStore::new());
    let (mut alice, _bob, _, _) = pair(&bus, &store, Language::Cpp).await;

    bus.set_offline(true);
    bus.disconnect_all().await;
    settle().await;
    assert!(matches!(alice.phase(), SessionPhase::Reconnecting { .. }));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(alice.phase(), SessionPhase::Failed(_)));

    alice.leave().await;
    assert_eq!(alice.phase(), SessionPhase::Idle);
}
