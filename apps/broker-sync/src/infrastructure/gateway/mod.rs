//! Gateway Infrastructure
//!
//! WebSocket connectivity to broker gateways: wire protocol, codec,
//! handshake state machine, heartbeat, reconnection, rate limiting, and
//! the connection lifecycle itself.

/// Connection lifecycle: dial, handshake, stream, reconnect.
pub mod connection;

/// JSON encode/decode for the wire protocol.
pub mod codec;

/// Handshake state machine and connection states.
pub mod handshake;

/// Ping/pong liveness monitoring.
pub mod heartbeat;

/// Wire message types.
pub mod messages;

/// Outbound rate limiting.
pub mod rate_limit;

/// Exponential backoff reconnection policy.
pub mod reconnect;

pub use connection::{
    ConnectError, Connection, ConnectionConfig, ConnectionError, ConnectionEvent, SendError,
};
pub use handshake::{ConnectionState, HandshakeError, HandshakeMachine};
pub use heartbeat::HeartbeatConfig;
pub use messages::{ClientMessage, GatewayMessage, OrderRequest, UserDataPayload};
pub use rate_limit::{RateCategory, RateLimitConfig, RateLimiter, RateLimiterSet};
pub use reconnect::ReconnectConfig;
