//! Connection lifecycle integration tests against the mock gateway:
//! handshake progression, connect deduplication, heartbeat-driven
//! reconnection, idempotent disconnect, and session resumption.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use broker_sync::{
    ConnectionManager, ConnectionState, FileStore, KeyValueStore, ManagerConnectExt, Side,
    SyncConfig,
};
use support::{GatewayBehavior, MockGateway, StaticTokenProvider, wait_until};

fn test_config(gateway: &MockGateway) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.base_url = gateway.base_url();
    config.websocket.handshake_timeout = Duration::from_secs(5);
    config.websocket.reconnect_delay_initial = Duration::from_millis(100);
    config.websocket.reconnect_delay_max = Duration::from_millis(500);
    config
}

fn manager_for(
    config: SyncConfig,
    store: Arc<FileStore>,
) -> Arc<ConnectionManager> {
    ConnectionManager::new(
        config,
        Arc::new(StaticTokenProvider("test-jwt")),
        store as Arc<dyn KeyValueStore>,
    )
}

#[tokio::test]
async fn handshake_reaches_ready_and_normalizes_initial_positions() {
    let gateway = MockGateway::spawn(GatewayBehavior {
        positions: serde_json::json!([{"id": 55, "symbol": "NQH6", "netPos": 2, "netPrice": 100}]),
        ..GatewayBehavior::default()
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(
        test_config(&gateway),
        Arc::new(FileStore::new(dir.path().join("state.json"))),
    );
    manager.start().await;

    manager.connect("tradovate", "123").await.unwrap();

    assert_eq!(
        manager.connection_state("tradovate", "123"),
        ConnectionState::Ready
    );

    // The initial sync flows through the reconciler into the cache.
    wait_until("initial positions to land", || {
        !manager.get_positions("tradovate", "123").is_empty()
    })
    .await;

    let positions = manager.get_positions("tradovate", "123");
    assert_eq!(positions.len(), 1);
    let position = &positions[0];
    assert_eq!(position.position_id, "55");
    assert_eq!(position.side, Side::Long);
    assert_eq!(position.quantity, Decimal::new(2, 0));
    assert_eq!(position.avg_price, Decimal::new(100, 0));

    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_connects_share_one_handshake() {
    let gateway = MockGateway::spawn(GatewayBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(
        test_config(&gateway),
        Arc::new(FileStore::new(dir.path().join("state.json"))),
    );
    manager.start().await;

    let first = tokio::spawn(manager.connect("tradovate", "123"));
    let second = tokio::spawn(manager.connect("tradovate", "123"));
    let third = tokio::spawn(manager.connect("tradovate", "123"));

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    third.await.unwrap().unwrap();

    // Every caller resolved, but the gateway saw exactly one socket.
    assert_eq!(gateway.connection_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn missed_pong_forces_reconnection() {
    let gateway = MockGateway::spawn(GatewayBehavior {
        respond_to_ping: false,
        ..GatewayBehavior::default()
    })
    .await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = test_config(&gateway);
    config.websocket.heartbeat_interval = Duration::from_millis(100);
    config.websocket.heartbeat_timeout = Duration::from_millis(150);

    let manager = manager_for(
        config,
        Arc::new(FileStore::new(dir.path().join("state.json"))),
    );
    manager.start().await;

    let mut states = manager.hub().state_rx();
    manager.connect("tradovate", "123").await.unwrap();

    // The silent gateway misses the pong window; the client closes the
    // socket and dials again.
    gateway.wait_for_connections(2).await;

    let mut saw_reconnecting = false;
    while let Ok(event) =
        tokio::time::timeout(Duration::from_secs(5), states.recv()).await
    {
        if event.unwrap().state == ConnectionState::Reconnecting {
            saw_reconnecting = true;
            break;
        }
    }
    assert!(saw_reconnecting, "a reconnecting state must be observed");

    manager.shutdown().await;
}

#[tokio::test]
async fn disconnect_is_idempotent_and_suppresses_reconnect() {
    let gateway = MockGateway::spawn(GatewayBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(
        test_config(&gateway),
        Arc::new(FileStore::new(dir.path().join("state.json"))),
    );
    manager.start().await;

    manager.connect("tradovate", "123").await.unwrap();
    assert!(manager.is_connected("tradovate", "123"));

    assert!(manager.disconnect("tradovate", "123"));
    // Second disconnect observes the same end state.
    assert!(!manager.disconnect("tradovate", "123"));
    assert!(!manager.is_connected("tradovate", "123"));

    // No reconnect is attempted after a manual disconnect.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(gateway.connection_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn session_token_is_persisted_and_replayed_on_reconnect() {
    let gateway = MockGateway::spawn(GatewayBehavior {
        session_id: Some("sess-1".to_string()),
        ..GatewayBehavior::default()
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path().join("state.json")));
    let manager = manager_for(test_config(&gateway), Arc::clone(&store));
    manager.start().await;

    manager.connect("tradovate", "123").await.unwrap();

    // The announced session token lands in durable storage.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stored = store.get("session:tradovate:123").await.ok().flatten();
        if stored.as_deref() == Some("sess-1") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for session persistence"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The first dial carried no session; the reconnect replays it.
    gateway.kill_connections();
    gateway.wait_for_connections(2).await;

    let uris = gateway.state.uris.lock().unwrap().clone();
    assert!(!uris[0].contains("session_id="));
    assert!(
        uris[1].contains("session_id=sess-1"),
        "reconnect URI should replay the session token: {}",
        uris[1]
    );

    manager.shutdown().await;
}
