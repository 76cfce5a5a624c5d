//! Gateway Handshake State Machine
//!
//! The gateway drives a multi-phase handshake before data flows:
//!
//! ```text
//! DISCONNECTED → CONNECTING → VALIDATING_USER → CHECKING_SUBSCRIPTION
//!     → CHECKING_BROKER_ACCESS → CONNECTING_TO_BROKER → CONNECTED → READY
//! ```
//!
//! The server is authoritative over phase progression; this machine only
//! reflects what inbound protocol messages say and reports the replies
//! the protocol requires (`connection_test` echo, pong). `READY` is
//! reached on an explicit `connection_ready` or on receipt of the
//! initial `user_data` sync after the broker link is up.
//!
//! An error while user validation is still in progress means the
//! credential itself was rejected and is fatal; errors in later phases
//! are retryable through reconnection.

use serde::{Deserialize, Serialize};

use super::messages::{ClientMessage, GatewayMessage};

// =============================================================================
// Connection State
// =============================================================================

/// Observable state of a gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Socket dialing / awaiting server acknowledgement.
    Connecting,
    /// Server is validating the user credential.
    ValidatingUser,
    /// Server is checking the subscription entitlement.
    CheckingSubscription,
    /// Server is checking broker access for the account.
    CheckingBrokerAccess,
    /// Server is establishing the broker link.
    ConnectingToBroker,
    /// Broker link up; awaiting initial data sync.
    Connected,
    /// Fully synchronized; sends flow immediately.
    Ready,
    /// Socket lost; a reconnect attempt is scheduled.
    Reconnecting,
    /// Terminal failure for this lifecycle.
    Error,
}

impl ConnectionState {
    /// Wire/display name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ValidatingUser => "validating_user",
            Self::CheckingSubscription => "checking_subscription",
            Self::CheckingBrokerAccess => "checking_broker_access",
            Self::ConnectingToBroker => "connecting_to_broker",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// Whether sends transmit immediately in this state.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether a handshake is in flight.
    #[must_use]
    pub const fn is_handshaking(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::ValidatingUser
                | Self::CheckingSubscription
                | Self::CheckingBrokerAccess
                | Self::ConnectingToBroker
                | Self::Connected
        )
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Handshake failures.
///
/// `Clone` because a failed connect settlement is shared between every
/// caller that awaited the same in-flight connect.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    /// The gateway rejected the credential. Fatal, never retried.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// The gateway reported an error after authentication. Retryable.
    #[error("gateway rejected connection: {0}")]
    ServerRejection(String),

    /// The handshake did not reach `READY` within the ceiling.
    #[error("handshake timed out")]
    Timeout,
}

impl HandshakeError {
    /// Whether reconnection may be attempted after this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthenticationRejected(_))
    }
}

// =============================================================================
// Machine
// =============================================================================

/// Protocol reply required by an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    /// Send this message back to the gateway.
    Reply(ClientMessage),
    /// Persist this session resumption token.
    PersistSession(String),
}

/// Result of feeding one inbound message to the machine.
#[derive(Debug, Default)]
pub struct HandshakeStep {
    /// Replies the protocol requires.
    pub actions: Vec<HandshakeAction>,
    /// Whether the observable state changed.
    pub state_changed: bool,
}

/// Explicit handshake state machine driven by inbound protocol messages.
///
/// # Example
///
/// ```rust
/// use broker_sync::infrastructure::gateway::handshake::{ConnectionState, HandshakeMachine};
/// use broker_sync::infrastructure::gateway::messages::GatewayMessage;
///
/// let mut machine = HandshakeMachine::new();
/// machine.on_dialing();
/// assert_eq!(machine.state(), ConnectionState::Connecting);
///
/// let msg: GatewayMessage =
///     serde_json::from_str(r#"{"type": "connection_ready"}"#).unwrap();
/// machine.handle(&msg);
/// assert!(machine.state().is_ready());
/// ```
#[derive(Debug, Default)]
pub struct HandshakeMachine {
    state: ConnectionState,
    session_id: Option<String>,
    failure: Option<HandshakeError>,
}

impl HandshakeMachine {
    /// Create a machine in the `DISCONNECTED` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current observable state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session resumption token announced by the server, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The failure that moved the machine to `ERROR`, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&HandshakeError> {
        self.failure.as_ref()
    }

    /// The socket is dialing.
    pub fn on_dialing(&mut self) {
        self.state = ConnectionState::Connecting;
        self.failure = None;
    }

    /// The socket closed; state falls back to `DISCONNECTED` unless the
    /// lifecycle already failed terminally.
    pub const fn on_socket_closed(&mut self) {
        if !matches!(self.state, ConnectionState::Error) {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// A reconnect attempt is scheduled.
    pub const fn on_reconnecting(&mut self) {
        self.state = ConnectionState::Reconnecting;
    }

    /// Feed one inbound message through the transition function.
    pub fn handle(&mut self, message: &GatewayMessage) -> HandshakeStep {
        let mut step = HandshakeStep::default();

        match message {
            GatewayMessage::ConnectionTest => {
                step.actions
                    .push(HandshakeAction::Reply(ClientMessage::ConnectionTestResponse));
            }
            GatewayMessage::Ping => {
                step.actions.push(HandshakeAction::Reply(ClientMessage::Pong));
            }
            GatewayMessage::ConnectionEstablished { .. } => {
                step.state_changed = self.transition(ConnectionState::ValidatingUser);
            }
            GatewayMessage::ValidationProgress { status, .. } => {
                if let Some(state) = Self::phase_for_progress(status) {
                    step.state_changed = self.transition(state);
                }
            }
            GatewayMessage::ConnectionState {
                state,
                message,
                error,
            } => {
                step.state_changed = self.on_phase_settled(state, message.as_deref(), error.as_deref());
            }
            GatewayMessage::ConnectionReady => {
                step.state_changed = self.transition(ConnectionState::Ready);
            }
            GatewayMessage::SessionInfo { session_id } => {
                self.session_id = Some(session_id.clone());
                step.actions
                    .push(HandshakeAction::PersistSession(session_id.clone()));
            }
            GatewayMessage::UserData { .. } => {
                // Initial sync completes the handshake.
                if !self.state.is_ready() && self.state != ConnectionState::Error {
                    step.state_changed = self.transition(ConnectionState::Ready);
                }
            }
            _ => {}
        }

        step
    }

    /// Map an in-progress phase announcement to a state.
    fn phase_for_progress(status: &str) -> Option<ConnectionState> {
        match status {
            "validating_user" => Some(ConnectionState::ValidatingUser),
            "checking_subscription" => Some(ConnectionState::CheckingSubscription),
            "checking_broker_access" => Some(ConnectionState::CheckingBrokerAccess),
            "connecting_to_broker" => Some(ConnectionState::ConnectingToBroker),
            _ => None,
        }
    }

    /// Apply a settled-phase confirmation (or error) from the server.
    fn on_phase_settled(
        &mut self,
        state: &str,
        message: Option<&str>,
        error: Option<&str>,
    ) -> bool {
        if state == "error" || error.is_some() {
            let detail = error
                .or(message)
                .unwrap_or("gateway reported an error")
                .to_string();
            let failure = if matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::ValidatingUser
            ) {
                HandshakeError::AuthenticationRejected(detail)
            } else {
                HandshakeError::ServerRejection(detail)
            };
            self.failure = Some(failure);
            return self.transition(ConnectionState::Error);
        }

        let next = match state {
            "authenticated" => Some(ConnectionState::CheckingSubscription),
            "subscription_verified" => Some(ConnectionState::CheckingBrokerAccess),
            "broker_connected" => Some(ConnectionState::Connected),
            "ready" => Some(ConnectionState::Ready),
            _ => None,
        };
        next.is_some_and(|state| self.transition(state))
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "handshake transition");
        self.state = next;
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
