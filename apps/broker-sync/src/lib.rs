#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Broker Sync - Real-time Account Synchronization
//!
//! Keeps a client's view of broker accounts, positions, orders, and
//! quotes consistent with remote trading gateways over persistent
//! WebSocket connections.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Canonical models and routing logic
//!   - `position`: Position/order/account/quote models plus the raw
//!     payload union normalized once at ingress
//!   - `subscription`: Symbol interest routing with upstream dedup
//!
//! - **Application**: Services and port definitions
//!   - `ports`: Credential provider and durable key-value store
//!   - `services`: Position reconciliation, throttling, and health
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `gateway`: WebSocket protocol, handshake machine, heartbeat,
//!     reconnection, rate limiting, connection lifecycle
//!   - `manager`: Connection registry, shared pool, layered TTL cache
//!   - `broadcast`: Typed event hub
//!   - `storage`: JSON file key-value store
//!   - `config`: Environment-driven settings
//!
//! # Data Flow
//!
//! ```text
//! Gateway WS ──┐
//!              │     ┌─────────────┐     ┌─────────────┐
//!              ├────►│  Connection │────►│   Manager   │──► Event Hub ──► UI
//! Gateway WS ──┤     │  (per a/c)  │     │  + Cache    │
//!              │     └─────────────┘     │  Reconciler │
//! Gateway WS ──┘                         └─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core synchronization types.
pub mod domain;

/// Application layer - Services and ports.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::position::{AccountSnapshot, MarketData, Order, Position, Side};
pub use domain::subscription::{
    ConnectionKey, RoutingChanges, SubscriptionRouter, SubscriptionType,
};

// Ports
pub use application::ports::{EnvTokenProvider, KeyValueStore, TokenError, TokenProvider};

// Reconciler
pub use application::services::{PositionReconciler, ReconcilerStatus};

// Gateway
pub use infrastructure::gateway::{
    ClientMessage, ConnectError, ConnectionState, GatewayMessage, OrderRequest, RateCategory,
};

// Manager
pub use infrastructure::manager::{
    ConnectionManager, DataCache, ManagerConnectExt, ManagerError, SharedConnectionKey,
};

// Event hub
pub use infrastructure::broadcast::{
    AccountEvent, EventHub, MarketDataEvent, OrderEvent, PositionChange, PositionEvent,
    SharedEventHub, StateEvent,
};

// Config
pub use infrastructure::config::{ConfigError, Environment, SyncConfig};

// Storage
pub use infrastructure::storage::FileStore;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
