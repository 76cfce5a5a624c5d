//! In-process mock broker gateway for integration tests.
//!
//! Accepts WebSocket connections, drives the multi-phase handshake the
//! client expects, and records everything the client sends so tests can
//! assert on upstream traffic.

// Each integration test crate compiles its own copy; not every test
// uses every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

use broker_sync::application::ports::{TokenError, TokenProvider};

/// Static token provider for tests.
pub struct StaticTokenProvider(pub &'static str);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, TokenError> {
        Ok(self.0.to_string())
    }
}

/// Scripted behavior for the mock gateway.
#[derive(Debug, Clone)]
pub struct GatewayBehavior {
    /// Drive the full handshake ladder and send the initial sync.
    pub complete_handshake: bool,
    /// Positions array delivered in the `user_data` initial sync.
    pub positions: serde_json::Value,
    /// Accounts array delivered in the `user_data` initial sync.
    pub accounts: serde_json::Value,
    /// Reply `pong` to application-level pings.
    pub respond_to_ping: bool,
    /// Session token announced after the broker link comes up.
    pub session_id: Option<String>,
    /// Acknowledge `order`/`cancel_order` with an `order_update`.
    pub ack_orders: bool,
    /// Reply to `subscribe` with one `market_data` tick.
    pub ack_subscribes: bool,
}

impl Default for GatewayBehavior {
    fn default() -> Self {
        Self {
            complete_handshake: true,
            positions: serde_json::json!([]),
            accounts: serde_json::json!([]),
            respond_to_ping: true,
            session_id: None,
            ack_orders: false,
            ack_subscribes: false,
        }
    }
}

/// Shared observable state of the mock gateway.
pub struct GatewayState {
    behavior: GatewayBehavior,
    /// Number of sockets accepted so far.
    pub connections: AtomicUsize,
    /// Request URIs of accepted sockets, in order.
    pub uris: StdMutex<Vec<String>>,
    /// Every JSON message received from clients.
    pub inbound: StdMutex<Vec<serde_json::Value>>,
    /// Dropping the current sockets is requested.
    kill: Notify,
}

impl GatewayState {
    /// Inbound messages of one `type`.
    pub fn inbound_of_type(&self, message_type: &str) -> Vec<serde_json::Value> {
        self.inbound
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.get("type").and_then(|t| t.as_str()) == Some(message_type))
            .cloned()
            .collect()
    }
}

/// A running mock gateway.
pub struct MockGateway {
    addr: SocketAddr,
    /// Observable state shared with connection tasks.
    pub state: Arc<GatewayState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockGateway {
    /// Bind a listener and start accepting connections.
    pub async fn spawn(behavior: GatewayBehavior) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(GatewayState {
            behavior,
            connections: AtomicUsize::new(0),
            uris: StdMutex::new(Vec::new()),
            inbound: StdMutex::new(Vec::new()),
            kill: Notify::new(),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            let _ = handle_socket(state, stream).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Base URL for `SyncConfig::base_url`.
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of sockets accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Drop every currently open socket.
    pub fn kill_connections(&self) {
        self.state.kill.notify_waiters();
    }

    /// Wait until at least `count` sockets have been accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while self.connection_count() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} connections (saw {})",
                self.connection_count()
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

/// Poll until a condition holds, panicking after 10 seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn handle_socket(
    state: Arc<GatewayState>,
    stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let uri = Arc::new(StdMutex::new(String::new()));
    let uri_capture = Arc::clone(&uri);
    let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *uri_capture.lock().unwrap() = req.uri().to_string();
        Ok(resp)
    })
    .await?;

    state.connections.fetch_add(1, Ordering::SeqCst);
    state.uris.lock().unwrap().push(uri.lock().unwrap().clone());

    let (mut write, mut read) = ws.split();
    let behavior = state.behavior.clone();

    if behavior.complete_handshake {
        let mut script = vec![
            serde_json::json!({"type": "connection_established"}),
            serde_json::json!({"type": "validation_progress", "status": "validating_user"}),
            serde_json::json!({"type": "connection_state", "state": "authenticated"}),
            serde_json::json!({"type": "connection_state", "state": "subscription_verified"}),
            serde_json::json!({"type": "validation_progress", "status": "connecting_to_broker"}),
            serde_json::json!({"type": "connection_state", "state": "broker_connected"}),
        ];
        if let Some(session_id) = &behavior.session_id {
            script.push(serde_json::json!({"type": "session_info", "session_id": session_id}));
        }
        script.push(serde_json::json!({
            "type": "user_data",
            "data": {
                "accounts": behavior.accounts,
                "positions": behavior.positions,
                "orders": []
            }
        }));

        for message in script {
            write.send(Message::Text(message.to_string().into())).await?;
        }
    }

    loop {
        tokio::select! {
            () = state.kill.notified() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = read.next() => {
                let Some(Ok(frame)) = frame else { return Ok(()) };
                let Message::Text(text) = frame else { continue };
                let Ok(message) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                state.inbound.lock().unwrap().push(message.clone());

                match message.get("type").and_then(|t| t.as_str()) {
                    Some("ping") if behavior.respond_to_ping => {
                        write
                            .send(Message::Text(r#"{"type":"pong"}"#.to_string().into()))
                            .await?;
                    }
                    Some("order") if behavior.ack_orders => {
                        let symbol = message
                            .pointer("/orderData/symbol")
                            .and_then(|s| s.as_str())
                            .unwrap_or("UNKNOWN");
                        let ack = serde_json::json!({
                            "type": "order_update",
                            "data": {
                                "orderId": 9001,
                                "symbol": symbol,
                                "orderStatus": "Working",
                                "orderQty": message.pointer("/orderData/quantity").cloned()
                            }
                        });
                        write.send(Message::Text(ack.to_string().into())).await?;
                    }
                    Some("cancel_order") if behavior.ack_orders => {
                        let order_id = message
                            .get("orderId")
                            .cloned()
                            .unwrap_or(serde_json::json!("0"));
                        let ack = serde_json::json!({
                            "type": "order_update",
                            "data": {
                                "orderId": order_id,
                                "orderStatus": "Cancelled"
                            }
                        });
                        write.send(Message::Text(ack.to_string().into())).await?;
                    }
                    Some("subscribe") if behavior.ack_subscribes => {
                        let symbol = message
                            .get("symbol")
                            .and_then(|s| s.as_str())
                            .unwrap_or("UNKNOWN");
                        let tick = serde_json::json!({
                            "type": "market_data",
                            "data": {"symbol": symbol, "price": 100.25, "bid": 100.0, "ask": 100.5}
                        });
                        write.send(Message::Text(tick.to_string().into())).await?;
                    }
                    _ => {}
                }
            }
        }
    }
}
