//! Market Data Subscription Routing
//!
//! Tracks which logical connections are interested in which symbols so
//! that upstream subscribe/unsubscribe traffic is deduplicated: the
//! gateway sees one `subscribe` when interest appears (refcount 0→1) and
//! one `unsubscribe` when the last interested connection leaves (1→0).
//! Everything in between is pure local bookkeeping.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;

// =============================================================================
// Types
// =============================================================================

/// Identity of a logical connection: one (broker, account) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Broker identifier.
    pub broker_id: String,
    /// Account identifier.
    pub account_id: String,
}

impl ConnectionKey {
    /// Create a new connection key.
    #[must_use]
    pub fn new(broker_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            broker_id: broker_id.into(),
            account_id: account_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.broker_id, self.account_id)
    }
}

/// A symbol string.
pub type Symbol = String;

/// Kind of market data stream requested for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionType {
    /// Top-of-book quotes.
    #[default]
    Quote,
    /// Trade prints.
    Trade,
    /// Market depth.
    Depth,
    /// Chart/bar data.
    Chart,
}

impl SubscriptionType {
    /// All subscription types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Quote, Self::Trade, Self::Depth, Self::Chart]
    }

    /// Wire name used in subscribe/unsubscribe messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Trade => "trade",
            Self::Depth => "depth",
            Self::Chart => "chart",
        }
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Upstream traffic implied by a routing change.
#[derive(Debug, Clone, Default)]
pub struct RoutingChanges {
    /// Symbols that now need an upstream subscribe.
    pub subscribe: HashSet<Symbol>,
    /// Symbols that now need an upstream unsubscribe.
    pub unsubscribe: HashSet<Symbol>,
}

impl RoutingChanges {
    /// Whether no upstream traffic is needed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    fn subscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: symbols.into_iter().collect(),
            unsubscribe: HashSet::new(),
        }
    }

    fn unsubscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: HashSet::new(),
            unsubscribe: symbols.into_iter().collect(),
        }
    }
}

// =============================================================================
// Per-type State
// =============================================================================

/// Interest tracking for one subscription type.
#[derive(Debug, Default)]
struct TypeRoutingState {
    /// Connection → symbols it is interested in.
    connection_symbols: HashMap<ConnectionKey, HashSet<Symbol>>,
    /// Symbol → interest refcount.
    symbol_refcount: HashMap<Symbol, usize>,
}

impl TypeRoutingState {
    /// Returns symbols whose refcount went 0→1.
    fn add(&mut self, connection: &ConnectionKey, symbol: &str) -> Vec<Symbol> {
        let set = self
            .connection_symbols
            .entry(connection.clone())
            .or_default();
        if !set.insert(symbol.to_string()) {
            return vec![];
        }

        let refcount = self.symbol_refcount.entry(symbol.to_string()).or_insert(0);
        *refcount += 1;

        if *refcount == 1 {
            vec![symbol.to_string()]
        } else {
            vec![]
        }
    }

    /// Returns symbols whose refcount went 1→0.
    fn remove(&mut self, connection: &ConnectionKey, symbol: &str) -> Vec<Symbol> {
        let Some(set) = self.connection_symbols.get_mut(connection) else {
            return vec![];
        };
        if !set.remove(symbol) {
            return vec![];
        }
        if set.is_empty() {
            self.connection_symbols.remove(connection);
        }

        if let Some(refcount) = self.symbol_refcount.get_mut(symbol) {
            *refcount = refcount.saturating_sub(1);
            if *refcount == 0 {
                self.symbol_refcount.remove(symbol);
                return vec![symbol.to_string()];
            }
        }
        vec![]
    }

    /// Drop every subscription a connection held; returns 1→0 symbols.
    fn remove_connection(&mut self, connection: &ConnectionKey) -> Vec<Symbol> {
        let Some(symbols) = self.connection_symbols.remove(connection) else {
            return vec![];
        };

        let mut released = Vec::new();
        for symbol in symbols {
            if let Some(refcount) = self.symbol_refcount.get_mut(&symbol) {
                *refcount = refcount.saturating_sub(1);
                if *refcount == 0 {
                    self.symbol_refcount.remove(&symbol);
                    released.push(symbol);
                }
            }
        }
        released
    }

    fn interested(&self, symbol: &str) -> Vec<ConnectionKey> {
        self.connection_symbols
            .iter()
            .filter(|(_, symbols)| symbols.contains(symbol))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn active_symbols(&self) -> Vec<Symbol> {
        self.symbol_refcount.keys().cloned().collect()
    }
}

// =============================================================================
// Subscription Router
// =============================================================================

/// Thread-safe symbol interest router shared by the connection manager.
///
/// # Example
///
/// ```rust
/// use broker_sync::domain::subscription::{
///     ConnectionKey, SubscriptionRouter, SubscriptionType,
/// };
///
/// let router = SubscriptionRouter::new();
/// let a = ConnectionKey::new("tradovate", "123");
/// let b = ConnectionKey::new("tradovate", "456");
///
/// // First interest forwards upstream.
/// let changes = router.subscribe(&a, SubscriptionType::Quote, "NQH6");
/// assert!(changes.subscribe.contains("NQH6"));
///
/// // Second interest is local only.
/// let changes = router.subscribe(&b, SubscriptionType::Quote, "NQH6");
/// assert!(changes.is_empty());
///
/// // Upstream unsubscribe only once the last interest leaves.
/// assert!(router.unsubscribe(&a, SubscriptionType::Quote, "NQH6").is_empty());
/// assert!(
///     router
///         .unsubscribe(&b, SubscriptionType::Quote, "NQH6")
///         .unsubscribe
///         .contains("NQH6")
/// );
/// ```
pub struct SubscriptionRouter {
    quotes: RwLock<TypeRoutingState>,
    trades: RwLock<TypeRoutingState>,
    depth: RwLock<TypeRoutingState>,
    charts: RwLock<TypeRoutingState>,
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(TypeRoutingState::default()),
            trades: RwLock::new(TypeRoutingState::default()),
            depth: RwLock::new(TypeRoutingState::default()),
            charts: RwLock::new(TypeRoutingState::default()),
        }
    }

    /// Register interest; returns upstream traffic to forward.
    pub fn subscribe(
        &self,
        connection: &ConnectionKey,
        sub_type: SubscriptionType,
        symbol: &str,
    ) -> RoutingChanges {
        let added = self.state(sub_type).write().add(connection, symbol);
        RoutingChanges::subscribe_only(added)
    }

    /// Drop interest; returns upstream traffic to forward.
    pub fn unsubscribe(
        &self,
        connection: &ConnectionKey,
        sub_type: SubscriptionType,
        symbol: &str,
    ) -> RoutingChanges {
        let removed = self.state(sub_type).write().remove(connection, symbol);
        RoutingChanges::unsubscribe_only(removed)
    }

    /// Drop all interest a connection held (it disconnected).
    ///
    /// Returns per-type upstream unsubscribes.
    pub fn connection_closed(
        &self,
        connection: &ConnectionKey,
    ) -> HashMap<SubscriptionType, RoutingChanges> {
        let mut changes = HashMap::new();
        for sub_type in SubscriptionType::all() {
            let removed = self
                .state(*sub_type)
                .write()
                .remove_connection(connection);
            if !removed.is_empty() {
                changes.insert(*sub_type, RoutingChanges::unsubscribe_only(removed));
            }
        }
        changes
    }

    /// Connections currently interested in a symbol.
    #[must_use]
    pub fn interested(&self, sub_type: SubscriptionType, symbol: &str) -> Vec<ConnectionKey> {
        self.state(sub_type).read().interested(symbol)
    }

    /// Symbols with at least one interested connection.
    #[must_use]
    pub fn active_symbols(&self, sub_type: SubscriptionType) -> Vec<Symbol> {
        self.state(sub_type).read().active_symbols()
    }

    const fn state(&self, sub_type: SubscriptionType) -> &RwLock<TypeRoutingState> {
        match sub_type {
            SubscriptionType::Quote => &self.quotes,
            SubscriptionType::Trade => &self.trades,
            SubscriptionType::Depth => &self.depth,
            SubscriptionType::Chart => &self.charts,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
