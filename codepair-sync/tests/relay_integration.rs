//! End-to-end tests through a real relay.
//!
//! These tests start a `BusRelay` on a free port and connect `WsBus`
//! clients, verifying the whole path: frame codec, fan-out, presence and
//! connection cleanup.

use std::sync::Arc;

use codepair_sync::protocol::{channel_name, BroadcastMessage, BusEvent, CursorPosition, Identity};
use codepair_sync::{
    Bus, BusRelay, ConnectionState, Language, MemoryStore, RelayConfig, SessionLifecycle, SyncConfig, WsBus,
};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Start a relay on a free port, return its URL and a handle to its bus.
async fn start_relay() -> (String, codepair_sync::MemoryBus) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = BusRelay::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::default()
    });
    let bus = relay.bus().clone();
    tokio::spawn(async move {
        relay.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), bus)
}

/// Poll `check` until it holds or two seconds pass.
async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn next_broadcast(sub: &mut codepair_sync::Subscription) -> BroadcastMessage {
    loop {
        match timeout(Duration::from_secs(2), sub.recv()).await {
            Ok(Some(BusEvent::Broadcast(msg))) => return msg,
            Ok(Some(BusEvent::PresenceSync(_))) => continue,
            other => panic!("Expected broadcast, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (url, _) = start_relay().await;
    let bus = WsBus::new(&url);
    assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
    bus.connect().await.unwrap();
    assert_eq!(bus.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_publish_reaches_other_subscriber_only() {
    let (url, _) = start_relay().await;
    let channel = channel_name(Uuid::new_v4());
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let alice_bus = WsBus::new(&url);
    let bob_bus = WsBus::new(&url);
    let mut alice_sub = alice_bus.subscribe(&channel, alice).await.unwrap();
    let mut bob_sub = bob_bus.subscribe(&channel, bob).await.unwrap();
    // Subscribe frames are processed in order before the publish below.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let msg = BroadcastMessage::CodeUpdate {
        content: "fn main() {}".into(),
        origin_id: alice,
    };
    alice_bus.publish(&channel, &msg).await.unwrap();
    assert_eq!(next_broadcast(&mut bob_sub).await, msg);

    // Nothing comes back to the sender.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some(event) = alice_sub.try_recv() {
        assert!(matches!(event, BusEvent::PresenceSync(_)), "sender got {event:?}");
    }
}

#[tokio::test]
async fn test_presence_dropped_when_socket_closes() {
    let (url, relay_bus) = start_relay().await;
    let channel = channel_name(Uuid::new_v4());
    let user = Identity::new(Uuid::new_v4(), "transient");

    {
        let bus = WsBus::new(&url);
        let _sub = bus.subscribe(&channel, user.user_id).await.unwrap();
        bus.track(&channel, user.presence(None, 1)).await.unwrap();
        let rb = relay_bus.clone();
        let ch = channel.clone();
        let seen = timeout(Duration::from_secs(2), async move {
            while rb.presence(&ch).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(seen.is_ok(), "relay should record presence");
    }
    // WsBus dropped: its writer ends and the socket closes.

    let cleared = timeout(Duration::from_secs(2), async {
        while !relay_bus.presence(&channel).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(cleared.is_ok(), "presence should be removed on disconnect");
}

#[tokio::test]
async fn test_sessions_sync_over_relay() {
    let (url, _) = start_relay().await;
    let store = MemoryStore::new();

    let mut alice = SessionLifecycle::new(
        Identity::new(Uuid::new_v4(), "alice"),
        Arc::new(WsBus::new(&url)),
        Arc::new(store.clone()),
        SyncConfig::for_testing(),
    );
    let mut bob = SessionLifecycle::new(
        Identity::new(Uuid::new_v4(), "bob"),
        Arc::new(WsBus::new(&url)),
        Arc::new(store.clone()),
        SyncConfig::for_testing(),
    );

    let code = alice.create(Language::Python).await.unwrap().join_code().to_string();
    bob.join(&code).await.unwrap();

    let bob_session = bob.session().unwrap();
    assert!(wait_for(|| bob_session.participants().len() == 2).await);

    alice
        .session_mut()
        .unwrap()
        .edit_document("print(1)")
        .await
        .unwrap();
    let bob_session = bob.session().unwrap();
    assert!(wait_for(|| bob_session.content() == "print(1)").await);

    alice.session_mut().unwrap().set_language(Language::Cpp).await.unwrap();
    let bob_session = bob.session().unwrap();
    assert!(wait_for(|| bob_session.language() == Language::Cpp).await);

    let bob_id = bob.identity().user_id;
    bob.session_mut()
        .unwrap()
        .move_cursor(CursorPosition::new(3.0, 4.0))
        .unwrap();
    let alice_session = alice.session().unwrap();
    assert!(
        wait_for(|| {
            alice_session
                .participant(bob_id)
                .and_then(|p| p.cursor_position)
                == Some(CursorPosition::new(3.0, 4.0))
        })
        .await
    );

    bob.leave().await;
    let alice_session = alice.session().unwrap();
    assert!(wait_for(|| alice_session.participants().len() == 1).await);
    alice.leave().await;
}

#[tokio::test]
async fn test_relay_counts_connections() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(BusRelay::with_defaults());
    let serving = relay.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let bus = WsBus::new(format!("ws://127.0.0.1:{port}"));
    let _sub = bus.subscribe("session-stats", Uuid::new_v4()).await.unwrap();

    let counted = timeout(Duration::from_secs(2), async {
        loop {
            let stats = relay.stats().await;
            if stats.total_connections == 1 && stats.total_frames >= 1 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relay should count the connection");
    assert_eq!(counted.active_connections, 1);
}
