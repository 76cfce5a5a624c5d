//! Gateway Connection
//!
//! Owns one physical WebSocket for a (broker, account) pair and drives
//! its full lifecycle: dial, multi-phase handshake, heartbeat, outbound
//! queue, and reconnection with exponential backoff. The server is
//! authoritative over handshake progression; this type reflects it
//! through a watch channel and an event stream consumed by the
//! connection manager.
//!
//! # Send semantics
//!
//! `send()` never blocks: when the connection is `READY` the message
//! goes straight onto the socket writer; during a handshake or a
//! reconnect window it is queued and flushed once `READY` is reached;
//! it fails only when no lifecycle is active at all.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::ConnectionKey;

use super::codec::{CodecError, JsonCodec};
use super::handshake::{
    ConnectionState, HandshakeAction, HandshakeError, HandshakeMachine,
};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use super::messages::{ClientMessage, GatewayMessage};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while running a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The socket could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Handshake failure (timeout, auth rejection, server rejection).
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Codec error on an outbound frame.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No pong arrived within the heartbeat window.
    #[error("heartbeat timeout: no pong within the window")]
    PongTimeout,

    /// The server closed the socket.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Every allowed reconnection attempt failed.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    /// `run()` was invoked more than once.
    #[error("connection is already running")]
    AlreadyRunning,
}

/// Failure of a `connect()` settlement.
///
/// `Clone` so concurrent connect callers deduplicated onto one in-flight
/// attempt all observe the same resolution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// The handshake failed.
    #[error(transparent)]
    Handshake(HandshakeError),

    /// `disconnect()` was called while the connect was in flight.
    #[error("connect cancelled by disconnect")]
    Cancelled,

    /// The handshake ceiling elapsed before a terminal state.
    #[error("connect timed out before the connection became ready")]
    Timeout,

    /// The connection failed before reaching `READY`.
    #[error("connect failed: {0}")]
    Failed(String),
}

/// Errors from [`Connection::send`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// No lifecycle is active; the socket is gone.
    #[error("not connected")]
    NotConnected,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by a connection toward the manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Observable state changed.
    StateChanged {
        /// New state.
        state: ConnectionState,
        /// Error detail when entering `ERROR`.
        error: Option<String>,
    },
    /// The server assigned a session resumption token.
    SessionAssigned(String),
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number within this outage.
        attempt: u32,
    },
    /// A data message arrived (initial sync, position/account/order/market
    /// events).
    Message(Box<GatewayMessage>),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one gateway connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Logical identity of this connection.
    pub key: ConnectionKey,
    /// Full WebSocket URL including the credential query parameter.
    pub url: String,
    /// Heartbeat behavior.
    pub heartbeat: HeartbeatConfig,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Ceiling for the multi-phase handshake.
    pub handshake_timeout: Duration,
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
}

impl ConnectionConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(key: ConnectionKey, url: String) -> Self {
        Self {
            key,
            url,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            handshake_timeout: Duration::from_secs(120),
            outbound_capacity: 1024,
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One physical gateway connection.
pub struct Connection {
    config: ConnectionConfig,
    codec: JsonCodec,
    event_tx: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::Sender<ClientMessage>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<ClientMessage>>>,
    session_id: parking_lot::Mutex<Option<String>>,
}

impl Connection {
    /// Create a connection. `initial_session` is a previously persisted
    /// resumption token to replay on the first dial.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        initial_session: Option<String>,
        event_tx: mpsc::Sender<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        Arc::new(Self {
            config,
            codec: JsonCodec::new(),
            event_tx,
            cancel,
            state_tx,
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            session_id: parking_lot::Mutex::new(initial_session),
        })
    }

    /// Logical identity of this connection.
    #[must_use]
    pub const fn key(&self) -> &ConnectionKey {
        &self.config.key
    }

    /// Current observable state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Whether the connection is fully ready.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state().is_ready()
    }

    /// Session resumption token currently known, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Queue a message for transmission.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] when no lifecycle is active,
    /// [`SendError::QueueFull`] when the outbound queue is saturated.
    pub fn send(&self, message: ClientMessage) -> Result<(), SendError> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Error => {
                Err(SendError::NotConnected)
            }
            _ => self
                .outbound_tx
                .try_send(message)
                .map_err(|_| SendError::QueueFull),
        }
    }

    /// Stop this connection and suppress auto-reconnect. Idempotent.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Wait until this connection settles: `Ok(())` on `READY`, an error
    /// on `ERROR`, cancellation, or the handshake ceiling.
    ///
    /// # Errors
    ///
    /// Returns a cloneable [`ConnectError`] describing the settlement.
    pub async fn wait_ready(&self) -> Result<(), ConnectError> {
        let mut state_rx = self.state_tx.subscribe();
        let settled = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Error => {
                        return Err(ConnectError::Failed(
                            "connection entered error state".to_string(),
                        ));
                    }
                    _ => {}
                }
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(ConnectError::Cancelled),
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return Err(ConnectError::Failed(
                                "connection dropped before becoming ready".to_string(),
                            ));
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.handshake_timeout, settled).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout),
        }
    }

    /// Run the connection lifecycle: dial, handshake, stream, reconnect.
    ///
    /// Runs until `disconnect()` is called, the handshake fails fatally,
    /// or the reconnect attempt cap is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ConnectionError`] once no further attempt
    /// is allowed.
    pub async fn run(self: Arc<Self>) -> Result<(), ConnectionError> {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .ok_or(ConnectionError::AlreadyRunning)?;
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected, None).await;
                tracing::info!(key = %self.config.key, "connection cancelled");
                return Ok(());
            }

            let attempt_result = self.connect_and_stream(&mut outbound_rx).await;

            match attempt_result {
                AttemptOutcome::Cancelled => {
                    self.set_state(ConnectionState::Disconnected, None).await;
                    tracing::info!(key = %self.config.key, "connection cancelled");
                    return Ok(());
                }
                AttemptOutcome::Failed { error, was_ready } => {
                    tracing::warn!(key = %self.config.key, error = %error, "connection attempt ended");
                    metrics::counter!("broker_sync_connection_errors_total").increment(1);

                    if let ConnectionError::Handshake(handshake) = &error
                        && !handshake.is_retryable()
                    {
                        self.set_state(ConnectionState::Error, Some(error.to_string()))
                            .await;
                        return Err(error);
                    }

                    // A completed handshake earns a fresh backoff budget.
                    if was_ready {
                        policy.reset();
                    }

                    self.set_state(ConnectionState::Disconnected, None).await;

                    if let Some(delay) = policy.next_delay() {
                        let attempt = policy.attempt_count();
                        tracing::info!(
                            key = %self.config.key,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "reconnecting to gateway"
                        );
                        metrics::counter!("broker_sync_reconnects_total").increment(1);

                        self.set_state(ConnectionState::Reconnecting, None).await;
                        let _ = self
                            .event_tx
                            .send(ConnectionEvent::Reconnecting { attempt })
                            .await;

                        tokio::select! {
                            () = self.cancel.cancelled() => {
                                self.set_state(ConnectionState::Disconnected, None).await;
                                return Ok(());
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        self.set_state(
                            ConnectionState::Error,
                            Some("maximum reconnection attempts exceeded".to_string()),
                        )
                        .await;
                        return Err(ConnectionError::MaxReconnectAttemptsExceeded);
                    }
                }
            }
        }
    }

    /// Dial the socket and stream until cancellation or an error.
    async fn connect_and_stream(
        &self,
        outbound_rx: &mut mpsc::Receiver<ClientMessage>,
    ) -> AttemptOutcome {
        let url = self.attempt_url();
        let mut machine = HandshakeMachine::new();
        machine.on_dialing();
        self.set_state(ConnectionState::Connecting, None).await;

        tracing::info!(key = %self.config.key, "connecting to gateway");

        let (ws_stream, _response) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                return AttemptOutcome::Failed {
                    error: e.into(),
                    was_ready: false,
                };
            }
        };
        let (mut write, mut read) = ws_stream.split();

        // Heartbeat wiring for this attempt.
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(
            self.config.heartbeat.clone(),
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            heartbeat_cancel.clone(),
        );
        let _monitor_handle = tokio::spawn(monitor.run());

        let handshake_deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
        let mut was_ready = false;

        let outcome = loop {
            let ready = machine.state().is_ready();

            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break AttemptOutcome::Cancelled;
                }
                () = tokio::time::sleep_until(handshake_deadline), if !ready => {
                    break AttemptOutcome::Failed {
                        error: HandshakeError::Timeout.into(),
                        was_ready,
                    };
                }
                heartbeat_event = heartbeat_rx.recv() => {
                    match heartbeat_event {
                        Some(HeartbeatEvent::SendPing) => {
                            // Pings only flow on a ready connection.
                            if ready {
                                if let Err(e) = self.write_message(&mut write, &ClientMessage::Ping).await {
                                    break AttemptOutcome::Failed { error: e, was_ready };
                                }
                                heartbeat_state.mark_ping_sent();
                            }
                        }
                        Some(HeartbeatEvent::Timeout) => {
                            break AttemptOutcome::Failed {
                                error: ConnectionError::PongTimeout,
                                was_ready,
                            };
                        }
                        None => {
                            tracing::debug!("heartbeat channel closed");
                        }
                    }
                }
                outbound = outbound_rx.recv(), if ready => {
                    match outbound {
                        Some(message) => {
                            if let Err(e) = self.write_message(&mut write, &message).await {
                                break AttemptOutcome::Failed { error: e, was_ready };
                            }
                        }
                        None => {
                            // Sender side dropped; connection is shutting down.
                            break AttemptOutcome::Cancelled;
                        }
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_activity();
                            match self.handle_frame(&text, &mut machine, &mut write).await {
                                Ok(()) => {
                                    if machine.state().is_ready() {
                                        was_ready = true;
                                    }
                                }
                                Err(e) => break AttemptOutcome::Failed { error: e, was_ready },
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            heartbeat_state.record_activity();
                            if let Ok(text) = String::from_utf8(data.to_vec()) {
                                match self.handle_frame(&text, &mut machine, &mut write).await {
                                    Ok(()) => {
                                        if machine.state().is_ready() {
                                            was_ready = true;
                                        }
                                    }
                                    Err(e) => break AttemptOutcome::Failed { error: e, was_ready },
                                }
                            } else {
                                tracing::warn!(len = data.len(), "non-UTF8 binary frame ignored");
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_state.record_activity();
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break AttemptOutcome::Failed { error: e.into(), was_ready };
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat_state.record_activity();
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(key = %self.config.key, "server sent close frame");
                            break AttemptOutcome::Failed {
                                error: ConnectionError::ConnectionClosed,
                                was_ready,
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break AttemptOutcome::Failed { error: e.into(), was_ready };
                        }
                        None => {
                            break AttemptOutcome::Failed {
                                error: ConnectionError::ConnectionClosed,
                                was_ready,
                            };
                        }
                    }
                }
            }
        };

        heartbeat_cancel.cancel();
        outcome
    }

    /// Decode one frame, drive the handshake machine, and forward data.
    async fn handle_frame<W>(
        &self,
        text: &str,
        machine: &mut HandshakeMachine,
        write: &mut W,
    ) -> Result<(), ConnectionError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Into<tokio_tungstenite::tungstenite::Error>,
    {
        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => {
                // One malformed frame must not take the stream down.
                tracing::warn!(error = %e, "undecodable frame ignored");
                return Ok(());
            }
        };

        let step = machine.handle(&message);

        for action in step.actions {
            match action {
                HandshakeAction::Reply(reply) => {
                    self.write_message(write, &reply).await?;
                }
                HandshakeAction::PersistSession(session_id) => {
                    *self.session_id.lock() = Some(session_id.clone());
                    let _ = self
                        .event_tx
                        .send(ConnectionEvent::SessionAssigned(session_id))
                        .await;
                }
            }
        }

        if step.state_changed {
            let state = machine.state();
            let error = machine.failure().map(ToString::to_string);
            self.set_state(state, error).await;

            if state == ConnectionState::Error {
                let failure = machine.failure().cloned().unwrap_or_else(|| {
                    HandshakeError::ServerRejection("gateway reported an error".to_string())
                });
                return Err(failure.into());
            }
        }

        if is_data_message(&message) {
            let _ = self
                .event_tx
                .send(ConnectionEvent::Message(Box::new(message)))
                .await;
        }

        Ok(())
    }

    async fn write_message<W>(
        &self,
        write: &mut W,
        message: &ClientMessage,
    ) -> Result<(), ConnectionError>
    where
        W: SinkExt<Message> + Unpin,
        W::Error: Into<tokio_tungstenite::tungstenite::Error>,
    {
        let json = self.codec.encode(message)?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectionError::WebSocket(e.into()))
    }

    /// Publish a state change on the watch and the event stream.
    async fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let changed = {
            let current = *self.state_tx.borrow();
            current != state
        };
        if !changed {
            return;
        }
        self.state_tx.send_replace(state);
        let _ = self
            .event_tx
            .send(ConnectionEvent::StateChanged { state, error })
            .await;
    }

    /// URL for the next dial, replaying the session token when known.
    fn attempt_url(&self) -> String {
        let base = &self.config.url;
        self.session_id.lock().as_ref().map_or_else(
            || base.clone(),
            |session_id| {
                let separator = if base.contains('?') { '&' } else { '?' };
                format!("{base}{separator}session_id={session_id}")
            },
        )
    }
}

/// How one dial-and-stream attempt ended.
enum AttemptOutcome {
    /// `disconnect()` was requested.
    Cancelled,
    /// The attempt failed; `was_ready` notes whether the handshake had
    /// completed before the failure.
    Failed {
        error: ConnectionError,
        was_ready: bool,
    },
}

/// Whether a message carries data for the reconciliation/cache layer.
const fn is_data_message(message: &GatewayMessage) -> bool {
    matches!(
        message,
        GatewayMessage::UserData { .. }
            | GatewayMessage::PositionOpened { .. }
            | GatewayMessage::PositionClosed { .. }
            | GatewayMessage::PositionUpdated { .. }
            | GatewayMessage::PositionPriceUpdate { .. }
            | GatewayMessage::PositionPnlUpdate { .. }
            | GatewayMessage::PositionsSnapshot { .. }
            | GatewayMessage::AccountUpdate { .. }
            | GatewayMessage::OrderUpdate { .. }
            | GatewayMessage::MarketData { .. }
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(initial_session: Option<String>) -> Arc<Connection> {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let config = ConnectionConfig::new(
            ConnectionKey::new("tradovate", "123"),
            "ws://localhost:9999/ws/tradovate?broker_account_id=123&token=t".to_string(),
        );
        Connection::new(config, initial_session, event_tx, CancellationToken::new())
    }

    #[test]
    fn send_fails_when_disconnected() {
        let connection = make_connection(None);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.send(ClientMessage::GetPositions),
            Err(SendError::NotConnected)
        ));
    }

    #[test]
    fn send_enqueues_during_handshake() {
        let connection = make_connection(None);
        connection.state_tx.send_replace(ConnectionState::Connecting);
        assert!(connection.send(ClientMessage::GetPositions).is_ok());
    }

    #[test]
    fn send_enqueues_when_ready() {
        let connection = make_connection(None);
        connection.state_tx.send_replace(ConnectionState::Ready);
        assert!(connection.send(ClientMessage::Ping).is_ok());
    }

    #[test]
    fn attempt_url_without_session() {
        let connection = make_connection(None);
        assert!(!connection.attempt_url().contains("session_id"));
    }

    #[test]
    fn attempt_url_replays_session() {
        let connection = make_connection(Some("sess-9".to_string()));
        let url = connection.attempt_url();
        assert!(url.ends_with("&session_id=sess-9"));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let connection = make_connection(None);
        connection.disconnect();
        connection.disconnect();
        assert!(connection.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn wait_ready_rejects_on_cancel() {
        let connection = make_connection(None);
        connection.state_tx.send_replace(ConnectionState::Connecting);

        let waiter = Arc::clone(&connection);
        let handle = tokio::spawn(async move { waiter.wait_ready().await });

        connection.disconnect();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ConnectError::Cancelled)));
    }

    #[tokio::test]
    async fn wait_ready_resolves_on_ready() {
        let connection = make_connection(None);

        let waiter = Arc::clone(&connection);
        let handle = tokio::spawn(async move { waiter.wait_ready().await });

        tokio::task::yield_now().await;
        connection.state_tx.send_replace(ConnectionState::Ready);
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_ready_rejects_on_error_state() {
        let connection = make_connection(None);

        let waiter = Arc::clone(&connection);
        let handle = tokio::spawn(async move { waiter.wait_ready().await });

        tokio::task::yield_now().await;
        connection.state_tx.send_replace(ConnectionState::Error);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ConnectError::Failed(_))));
    }

    #[test]
    fn data_message_classification() {
        let data: GatewayMessage =
            serde_json::from_str(r#"{"type": "account_update", "data": {}}"#).unwrap();
        assert!(is_data_message(&data));

        let control: GatewayMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(!is_data_message(&control));
    }
}
