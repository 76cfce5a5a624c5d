//! Event Hub
//!
//! Typed broadcast channels carrying everything the rest of the
//! application observes: connection state transitions and normalized
//! position/account/order/market-data updates. Each event class has its
//! own channel so a slow consumer of one stream cannot lag another.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::domain::position::{AccountSnapshot, MarketData, Order, Position};
use crate::domain::subscription::ConnectionKey;
use crate::infrastructure::gateway::ConnectionState;

// =============================================================================
// Events
// =============================================================================

/// A connection state transition.
#[derive(Debug, Clone)]
pub struct StateEvent {
    /// Connection that transitioned.
    pub key: ConnectionKey,
    /// New state.
    pub state: ConnectionState,
    /// Error detail when entering `ERROR`.
    pub error: Option<String>,
}

/// What happened to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionChange {
    /// First sight of the position.
    Opened,
    /// Fields merged from an update.
    Updated,
    /// Removed from the active set.
    Closed,
    /// Part of a full snapshot replace.
    Snapshot,
}

/// A normalized position update.
#[derive(Debug, Clone)]
pub struct PositionEvent {
    /// Connection the update came from.
    pub key: ConnectionKey,
    /// What happened.
    pub change: PositionChange,
    /// The position after the change.
    pub position: Position,
    /// Aggregate unrealized PnL over the account's active set.
    pub total_unrealized_pnl: Decimal,
}

/// A normalized account update.
#[derive(Debug, Clone)]
pub struct AccountEvent {
    /// Connection the update came from.
    pub key: ConnectionKey,
    /// Updated account snapshot.
    pub account: AccountSnapshot,
}

/// A normalized order update.
#[derive(Debug, Clone)]
pub struct OrderEvent {
    /// Connection the update came from.
    pub key: ConnectionKey,
    /// Updated order.
    pub order: Order,
}

/// A market data tick.
#[derive(Debug, Clone)]
pub struct MarketDataEvent {
    /// Connection the tick came from.
    pub key: ConnectionKey,
    /// Tick payload, merged over the cached value.
    pub data: MarketData,
}

// =============================================================================
// Hub
// =============================================================================

/// Channel capacities for the hub.
#[derive(Debug, Clone, Copy)]
pub struct EventHubConfig {
    /// Capacity of the state channel.
    pub state_capacity: usize,
    /// Capacity of the position channel.
    pub positions_capacity: usize,
    /// Capacity of the account channel.
    pub accounts_capacity: usize,
    /// Capacity of the order channel.
    pub orders_capacity: usize,
    /// Capacity of the market data channel.
    pub market_data_capacity: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            state_capacity: 256,
            positions_capacity: 4_096,
            accounts_capacity: 1_024,
            orders_capacity: 1_024,
            market_data_capacity: 10_000,
        }
    }
}

/// Central hub for all event channels.
///
/// # Example
///
/// ```rust
/// use broker_sync::infrastructure::broadcast::{EventHub, EventHubConfig};
///
/// let hub = EventHub::new(EventHubConfig::default());
/// let mut state_rx = hub.state_rx();
/// // In another task: hub.send_state(event);
/// ```
#[derive(Debug)]
pub struct EventHub {
    state_tx: broadcast::Sender<StateEvent>,
    positions_tx: broadcast::Sender<PositionEvent>,
    accounts_tx: broadcast::Sender<AccountEvent>,
    orders_tx: broadcast::Sender<OrderEvent>,
    market_data_tx: broadcast::Sender<MarketDataEvent>,
}

impl EventHub {
    /// Create a hub with the given channel capacities.
    #[must_use]
    pub fn new(config: EventHubConfig) -> Self {
        Self {
            state_tx: broadcast::channel(config.state_capacity).0,
            positions_tx: broadcast::channel(config.positions_capacity).0,
            accounts_tx: broadcast::channel(config.accounts_capacity).0,
            orders_tx: broadcast::channel(config.orders_capacity).0,
            market_data_tx: broadcast::channel(config.market_data_capacity).0,
        }
    }

    /// Create a hub with default capacities.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EventHubConfig::default())
    }

    /// Publish a state transition.
    pub fn send_state(&self, event: StateEvent) -> Option<usize> {
        self.state_tx.send(event).ok()
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn state_rx(&self) -> broadcast::Receiver<StateEvent> {
        self.state_tx.subscribe()
    }

    /// Publish a position update.
    pub fn send_position(&self, event: PositionEvent) -> Option<usize> {
        self.positions_tx.send(event).ok()
    }

    /// Subscribe to position updates.
    #[must_use]
    pub fn positions_rx(&self) -> broadcast::Receiver<PositionEvent> {
        self.positions_tx.subscribe()
    }

    /// Publish an account update.
    pub fn send_account(&self, event: AccountEvent) -> Option<usize> {
        self.accounts_tx.send(event).ok()
    }

    /// Subscribe to account updates.
    #[must_use]
    pub fn accounts_rx(&self) -> broadcast::Receiver<AccountEvent> {
        self.accounts_tx.subscribe()
    }

    /// Publish an order update.
    pub fn send_order(&self, event: OrderEvent) -> Option<usize> {
        self.orders_tx.send(event).ok()
    }

    /// Subscribe to order updates.
    #[must_use]
    pub fn orders_rx(&self) -> broadcast::Receiver<OrderEvent> {
        self.orders_tx.subscribe()
    }

    /// Publish a market data tick.
    pub fn send_market_data(&self, event: MarketDataEvent) -> Option<usize> {
        self.market_data_tx.send(event).ok()
    }

    /// Subscribe to market data ticks.
    #[must_use]
    pub fn market_data_rx(&self) -> broadcast::Receiver<MarketDataEvent> {
        self.market_data_tx.subscribe()
    }

    /// Receiver counts for each channel.
    #[must_use]
    pub fn stats(&self) -> EventHubStats {
        EventHubStats {
            state_receivers: self.state_tx.receiver_count(),
            position_receivers: self.positions_tx.receiver_count(),
            account_receivers: self.accounts_tx.receiver_count(),
            order_receivers: self.orders_tx.receiver_count(),
            market_data_receivers: self.market_data_tx.receiver_count(),
        }
    }
}

/// Shared hub reference.
pub type SharedEventHub = Arc<EventHub>;

/// Receiver counts per channel.
#[derive(Debug, Clone, Default)]
pub struct EventHubStats {
    /// State channel receivers.
    pub state_receivers: usize,
    /// Position channel receivers.
    pub position_receivers: usize,
    /// Account channel receivers.
    pub account_receivers: usize,
    /// Order channel receivers.
    pub order_receivers: usize,
    /// Market data channel receivers.
    pub market_data_receivers: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn make_state_event() -> StateEvent {
        StateEvent {
            key: ConnectionKey::new("tradovate", "123"),
            state: ConnectionState::Ready,
            error: None,
        }
    }

    #[test]
    fn send_without_receivers_returns_none() {
        let hub = EventHub::with_defaults();
        assert!(hub.send_state(make_state_event()).is_none());
    }

    #[tokio::test]
    async fn state_events_are_delivered() {
        let hub = EventHub::with_defaults();
        let mut rx = hub.state_rx();

        let sent = hub.send_state(make_state_event());
        assert_eq!(sent, Some(1));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, ConnectionState::Ready);
        assert_eq!(event.key.account_id, "123");
    }

    #[tokio::test]
    async fn multiple_receivers_see_the_same_event() {
        let hub = EventHub::with_defaults();
        let mut rx1 = hub.market_data_rx();
        let mut rx2 = hub.market_data_rx();

        let event = MarketDataEvent {
            key: ConnectionKey::new("tradovate", "123"),
            data: MarketData {
                symbol: "NQH6".to_string(),
                price: Some(Decimal::new(100, 0)),
                bid: None,
                ask: None,
                volume: None,
                updated_at: Utc::now(),
            },
        };
        let _ = hub.send_market_data(event);

        assert_eq!(rx1.recv().await.unwrap().data.symbol, "NQH6");
        assert_eq!(rx2.recv().await.unwrap().data.symbol, "NQH6");
    }

    #[test]
    fn stats_track_receivers() {
        let hub = EventHub::with_defaults();
        let _state = hub.state_rx();
        let _positions = hub.positions_rx();
        let _orders = hub.orders_rx();

        let stats = hub.stats();
        assert_eq!(stats.state_receivers, 1);
        assert_eq!(stats.position_receivers, 1);
        assert_eq!(stats.order_receivers, 1);
        assert_eq!(stats.account_receivers, 0);
    }
}
