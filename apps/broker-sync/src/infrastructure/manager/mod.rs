//! Connection Registry / Manager
//!
//! The explicitly constructed, injected service that owns every gateway
//! connection and the process-wide read cache. Responsibilities:
//!
//! - create/destroy connections, deduplicating concurrent connect
//!   requests for the same (broker, account) onto one in-flight attempt;
//! - maintain the shared-connection pool keyed by (broker, environment)
//!   so several accounts can ride one physical socket;
//! - rate-limit every outbound send per category, delaying callers
//!   rather than dropping messages;
//! - hold the layered TTL cache, persist it periodically through the
//!   key-value store port, and rehydrate it at startup;
//! - pump connection events into the typed event hub and feed position
//!   traffic to the reconciler.
//!
//! The pool and cache are mutated only inside manager methods and the
//! event pump, never directly by external callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{KeyValueStore, StoreError, TokenProvider};
use crate::application::services::PositionReconciler;
use crate::domain::position::{AccountSnapshot, MarketData, Order, Position};
use crate::domain::subscription::{ConnectionKey, SubscriptionRouter, SubscriptionType};
use crate::infrastructure::broadcast::{
    AccountEvent, EventHub, MarketDataEvent, OrderEvent, SharedEventHub, StateEvent,
};
use crate::infrastructure::config::{Environment, SyncConfig};
use crate::infrastructure::gateway::{
    ClientMessage, ConnectError, Connection, ConnectionConfig, ConnectionEvent, ConnectionState,
    GatewayMessage, HandshakeError, HeartbeatConfig, OrderRequest, RateCategory, RateLimitConfig,
    RateLimiterSet, ReconnectConfig, SendError,
};

/// Layered TTL cache.
pub mod cache;

pub use cache::{CacheEntry, CacheSnapshot, DataCache};

/// Store key under which the cache snapshot is persisted.
const CACHE_SNAPSHOT_KEY: &str = "cache:snapshot";

/// Correlation window for order placement/cancel acknowledgements.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Types
// =============================================================================

/// Key of the shared-connection pool: one physical socket per
/// (broker, environment) when the optimization applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedConnectionKey {
    /// Broker identifier.
    pub broker_id: String,
    /// Broker environment.
    pub environment: Environment,
}

impl SharedConnectionKey {
    /// Create a shared pool key.
    #[must_use]
    pub fn new(broker_id: impl Into<String>, environment: Environment) -> Self {
        Self {
            broker_id: broker_id.into(),
            environment,
        }
    }
}

/// Errors surfaced by manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// No connection exists for the key.
    #[error("no connection for {0}")]
    NotConnected(ConnectionKey),

    /// The connection refused the send.
    #[error(transparent)]
    Send(#[from] SendError),

    /// No correlated acknowledgement arrived within the window.
    #[error("request timed out: {0}")]
    RequestTimeout(String),

    /// Durable storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One registered logical connection. Several keys may hold handles to
/// the same physical [`Connection`] when the shared pool applies.
struct ConnectionHandle {
    connection: Arc<Connection>,
    cancel: CancellationToken,
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

// =============================================================================
// Manager
// =============================================================================

/// The connection registry and cache owner.
pub struct ConnectionManager {
    config: SyncConfig,
    token_provider: Arc<dyn TokenProvider>,
    store: Arc<dyn KeyValueStore>,
    hub: SharedEventHub,
    router: Arc<SubscriptionRouter>,
    cache: Arc<DataCache>,
    reconciler: Arc<PositionReconciler>,
    limiters: RateLimiterSet,
    connections: parking_lot::RwLock<HashMap<ConnectionKey, ConnectionHandle>>,
    pending: Arc<parking_lot::Mutex<HashMap<ConnectionKey, ConnectFuture>>>,
    shared_pool: parking_lot::RwLock<HashMap<SharedConnectionKey, ConnectionKey>>,
    refresh_rx: parking_lot::Mutex<Option<mpsc::Receiver<ConnectionKey>>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager wired to the given collaborators.
    #[must_use]
    pub fn new(
        config: SyncConfig,
        token_provider: Arc<dyn TokenProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Arc<Self> {
        let hub: SharedEventHub = Arc::new(EventHub::with_defaults());
        let cache = Arc::new(DataCache::new(config.cache.clone()));
        let shutdown = CancellationToken::new();

        let (refresh_tx, refresh_rx) = mpsc::channel(64);
        let reconciler = PositionReconciler::new(
            config.reconciler.clone(),
            Arc::clone(&cache),
            Arc::clone(&hub),
            refresh_tx,
            shutdown.child_token(),
        );

        let limiters = RateLimiterSet::new(
            RateLimitConfig::new(
                config.rate_limits.default_limit,
                config.rate_limits.interval,
                config.rate_limits.min_backoff,
            ),
            RateLimitConfig::new(
                config.rate_limits.market_data_limit,
                config.rate_limits.interval,
                config.rate_limits.min_backoff,
            ),
            RateLimitConfig::new(
                config.rate_limits.orders_limit,
                config.rate_limits.interval,
                config.rate_limits.min_backoff,
            ),
        );

        Arc::new(Self {
            config,
            token_provider,
            store,
            hub,
            router: Arc::new(SubscriptionRouter::new()),
            cache,
            reconciler,
            limiters,
            connections: parking_lot::RwLock::new(HashMap::new()),
            pending: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            shared_pool: parking_lot::RwLock::new(HashMap::new()),
            refresh_rx: parking_lot::Mutex::new(Some(refresh_rx)),
            shutdown,
        })
    }

    /// Start background work: cache rehydration, periodic persistence,
    /// the reconciler sweep, and the snapshot-refresh pump.
    pub async fn start(self: &Arc<Self>) {
        self.restore_cache().await;

        tokio::spawn(Arc::clone(&self.reconciler).run());

        let persister = Arc::clone(self);
        tokio::spawn(async move { persister.run_cache_persistence().await });

        if let Some(refresh_rx) = self.refresh_rx.lock().take() {
            let refresher = Arc::clone(self);
            tokio::spawn(async move { refresher.run_refresh_pump(refresh_rx).await });
        }
    }

    /// Stop everything: persist the cache one last time, close every
    /// socket, and cancel background tasks.
    pub async fn shutdown(self: &Arc<Self>) {
        self.persist_cache().await;
        self.disconnect_all();
        self.shutdown.cancel();
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// The typed event hub.
    #[must_use]
    pub const fn hub(&self) -> &SharedEventHub {
        &self.hub
    }

    /// The position reconciliation service.
    #[must_use]
    pub const fn reconciler(&self) -> &Arc<PositionReconciler> {
        &self.reconciler
    }

    /// Current state of a connection.
    #[must_use]
    pub fn connection_state(&self, broker_id: &str, account_id: &str) -> ConnectionState {
        let key = ConnectionKey::new(broker_id, account_id);
        self.connections
            .read()
            .get(&key)
            .map_or(ConnectionState::Disconnected, |handle| {
                handle.connection.state()
            })
    }

    /// Whether a connection is fully ready.
    #[must_use]
    pub fn is_connected(&self, broker_id: &str, account_id: &str) -> bool {
        self.connection_state(broker_id, account_id).is_ready()
    }

    // =========================================================================
    // Sends
    // =========================================================================

    /// Send a message on a connection, honoring the category limiter.
    ///
    /// The limiter delays the caller when the window is exhausted; the
    /// message is never dropped by rate limiting.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotConnected`] for an unknown key, or the
    /// connection's [`SendError`].
    pub async fn send_message(
        &self,
        broker_id: &str,
        account_id: &str,
        message: ClientMessage,
        category: RateCategory,
    ) -> Result<(), ManagerError> {
        let key = ConnectionKey::new(broker_id, account_id);
        let connection = self.connection_for(&key)?;

        self.limiters.limiter(category).acquire().await;
        connection.send(message)?;
        metrics::counter!("broker_sync_messages_sent_total").increment(1);
        Ok(())
    }

    /// Subscribe to market data for a symbol.
    ///
    /// A cached value is delivered to the hub immediately; the upstream
    /// subscribe is forwarded only when this is the first interest.
    ///
    /// # Errors
    ///
    /// Returns a [`ManagerError`] when the upstream send is needed and
    /// fails.
    pub async fn subscribe_market_data(
        &self,
        broker_id: &str,
        account_id: &str,
        symbol: &str,
        sub_type: SubscriptionType,
    ) -> Result<(), ManagerError> {
        let key = ConnectionKey::new(broker_id, account_id);

        if let Some(cached) = self.cache.market_data(symbol) {
            let _ = self.hub.send_market_data(MarketDataEvent {
                key: key.clone(),
                data: cached,
            });
        }

        let changes = self.router.subscribe(&key, sub_type, symbol);
        if changes.subscribe.contains(symbol) {
            self.send_message(
                broker_id,
                account_id,
                ClientMessage::Subscribe {
                    symbol: symbol.to_string(),
                    subscription_type: sub_type.as_str().to_string(),
                },
                RateCategory::MarketData,
            )
            .await?;
        }
        Ok(())
    }

    /// Drop interest in a symbol, forwarding the upstream unsubscribe
    /// only once no connection remains interested.
    ///
    /// # Errors
    ///
    /// Returns a [`ManagerError`] when the upstream send is needed and
    /// fails.
    pub async fn unsubscribe_market_data(
        &self,
        broker_id: &str,
        account_id: &str,
        symbol: &str,
        sub_type: SubscriptionType,
    ) -> Result<(), ManagerError> {
        let key = ConnectionKey::new(broker_id, account_id);

        let changes = self.router.unsubscribe(&key, sub_type, symbol);
        if changes.unsubscribe.contains(symbol) {
            self.send_message(
                broker_id,
                account_id,
                ClientMessage::Unsubscribe {
                    symbol: symbol.to_string(),
                    subscription_type: sub_type.as_str().to_string(),
                },
                RateCategory::MarketData,
            )
            .await?;
        }
        Ok(())
    }

    /// Place an order and await the correlated `order_update`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::RequestTimeout`] when no update for the
    /// order's symbol arrives within the correlation window.
    pub async fn place_order(
        &self,
        broker_id: &str,
        account_id: &str,
        request: OrderRequest,
    ) -> Result<Order, ManagerError> {
        let key = ConnectionKey::new(broker_id, account_id);
        let symbol = request.symbol.clone();
        let mut orders_rx = self.hub.orders_rx();

        self.send_message(
            broker_id,
            account_id,
            ClientMessage::Order {
                order_data: request,
            },
            RateCategory::Orders,
        )
        .await?;

        Self::await_order_event(&mut orders_rx, REQUEST_TIMEOUT, |event| {
            event.key == key && event.order.symbol == symbol
        })
        .await
        .ok_or_else(|| ManagerError::RequestTimeout(format!("order placement for {symbol}")))
    }

    /// Cancel a working order and await the correlated `order_update`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::RequestTimeout`] when no update for the
    /// order arrives within the correlation window.
    pub async fn cancel_order(
        &self,
        broker_id: &str,
        account_id: &str,
        order_id: &str,
    ) -> Result<Order, ManagerError> {
        let key = ConnectionKey::new(broker_id, account_id);
        let mut orders_rx = self.hub.orders_rx();

        self.send_message(
            broker_id,
            account_id,
            ClientMessage::CancelOrder {
                order_id: order_id.to_string(),
            },
            RateCategory::Orders,
        )
        .await?;

        Self::await_order_event(&mut orders_rx, REQUEST_TIMEOUT, |event| {
            event.key == key && event.order.order_id == order_id
        })
        .await
        .ok_or_else(|| ManagerError::RequestTimeout(format!("cancel of order {order_id}")))
    }

    /// Request a fresh positions snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`ManagerError`] when the send fails.
    pub async fn refresh_positions(
        &self,
        broker_id: &str,
        account_id: &str,
    ) -> Result<(), ManagerError> {
        self.send_message(
            broker_id,
            account_id,
            ClientMessage::GetPositions,
            RateCategory::Default,
        )
        .await
    }

    // =========================================================================
    // Cache accessors (live reads, TTL never consulted)
    // =========================================================================

    /// Live positions for an account.
    #[must_use]
    pub fn get_positions(&self, broker_id: &str, account_id: &str) -> Vec<Position> {
        self.cache
            .positions(&ConnectionKey::new(broker_id, account_id))
    }

    /// Live market data for a symbol.
    #[must_use]
    pub fn get_market_data(&self, symbol: &str) -> Option<MarketData> {
        self.cache.market_data(symbol)
    }

    /// Live account data for an account.
    #[must_use]
    pub fn get_account_data(
        &self,
        broker_id: &str,
        account_id: &str,
    ) -> Option<AccountSnapshot> {
        self.cache
            .account_data(&ConnectionKey::new(broker_id, account_id))
    }

    /// Live orders for an account.
    #[must_use]
    pub fn get_orders(&self, broker_id: &str, account_id: &str) -> Vec<Order> {
        self.cache.orders(&ConnectionKey::new(broker_id, account_id))
    }

    /// Live positions across every account.
    #[must_use]
    pub fn get_all_positions(&self) -> Vec<Position> {
        self.cache.all_positions()
    }

    /// Live market data across every symbol.
    #[must_use]
    pub fn get_all_market_data(&self) -> Vec<MarketData> {
        self.cache.all_market_data()
    }

    /// Live account data across every account.
    #[must_use]
    pub fn get_all_account_data(&self) -> Vec<AccountSnapshot> {
        self.cache.all_account_data()
    }

    /// Live orders across every account.
    #[must_use]
    pub fn get_all_orders(&self) -> Vec<Order> {
        self.cache.all_orders()
    }

    /// Wipe the live cache and the persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`ManagerError::Store`] when the persisted snapshot
    /// cannot be deleted.
    pub async fn clear_cache(&self) -> Result<(), ManagerError> {
        self.cache.clear();
        self.store.delete(CACHE_SNAPSHOT_KEY).await?;
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn connection_for(&self, key: &ConnectionKey) -> Result<Arc<Connection>, ManagerError> {
        self.connections
            .read()
            .get(key)
            .map(|handle| Arc::clone(&handle.connection))
            .ok_or_else(|| ManagerError::NotConnected(key.clone()))
    }

    async fn await_order_event<F>(
        orders_rx: &mut tokio::sync::broadcast::Receiver<OrderEvent>,
        window: Duration,
        mut matches: F,
    ) -> Option<Order>
    where
        F: FnMut(&OrderEvent) -> bool,
    {
        let wait = async {
            loop {
                match orders_rx.recv().await {
                    Ok(event) if matches(&event) => return Some(event.order),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(window, wait).await.ok().flatten()
    }

    /// Forward one data message into the cache, hub, and reconciler.
    fn dispatch_data(&self, key: &ConnectionKey, message: &GatewayMessage) {
        let now = Utc::now();
        metrics::counter!("broker_sync_messages_received_total").increment(1);

        match message {
            GatewayMessage::UserData { data } => {
                for raw in &data.accounts {
                    let account = raw.normalize(&key.broker_id, &key.account_id, now);
                    self.cache.upsert_account(account.clone());
                    let _ = self.hub.send_account(AccountEvent {
                        key: key.clone(),
                        account,
                    });
                }
                for raw in &data.orders {
                    match raw.normalize(&key.broker_id, &key.account_id, now) {
                        Ok(order) => {
                            self.cache.upsert_order(order.clone());
                            let _ = self.hub.send_order(OrderEvent {
                                key: key.clone(),
                                order,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "malformed order in user_data")
                        }
                    }
                }
                self.reconciler.ingest(key, message);
            }
            GatewayMessage::AccountUpdate { data } => {
                let account = data.normalize(&key.broker_id, &key.account_id, now);
                self.cache.upsert_account(account.clone());
                let _ = self.hub.send_account(AccountEvent {
                    key: key.clone(),
                    account,
                });
            }
            GatewayMessage::OrderUpdate { data } => match data.normalize(&key.broker_id, &key.account_id, now) {
                Ok(order) => {
                    self.cache.upsert_order(order.clone());
                    let _ = self.hub.send_order(OrderEvent {
                        key: key.clone(),
                        order,
                    });
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "malformed order update"),
            },
            GatewayMessage::MarketData { data } => {
                if let Some(tick) = data.normalize(now) {
                    let merged = self.cache.upsert_market_data(tick);
                    let _ = self.hub.send_market_data(MarketDataEvent {
                        key: key.clone(),
                        data: merged,
                    });
                }
            }
            GatewayMessage::PositionOpened { .. }
            | GatewayMessage::PositionClosed { .. }
            | GatewayMessage::PositionUpdated { .. }
            | GatewayMessage::PositionPriceUpdate { .. }
            | GatewayMessage::PositionPnlUpdate { .. }
            | GatewayMessage::PositionsSnapshot { .. } => {
                self.reconciler.ingest(key, message);
            }
            _ => {}
        }
    }

    async fn run_refresh_pump(self: Arc<Self>, mut refresh_rx: mpsc::Receiver<ConnectionKey>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                request = refresh_rx.recv() => {
                    let Some(key) = request else { break };
                    if let Err(e) = self
                        .send_message(
                            &key.broker_id,
                            &key.account_id,
                            ClientMessage::GetPositions,
                            RateCategory::Default,
                        )
                        .await
                    {
                        tracing::warn!(key = %key, error = %e, "snapshot refresh send failed");
                    }
                }
            }
        }
    }

    async fn run_cache_persistence(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.cache.persist_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    self.persist_cache().await;
                    break;
                }
                _ = interval.tick() => {
                    self.persist_cache().await;
                }
            }
        }
    }

    async fn persist_cache(&self) {
        let snapshot = self.cache.snapshot(Utc::now());
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.store.put(CACHE_SNAPSHOT_KEY, &json).await {
                    tracing::warn!(error = %e, "cache persistence failed");
                } else {
                    metrics::counter!("broker_sync_cache_persists_total").increment(1);
                }
            }
            Err(e) => tracing::warn!(error = %e, "cache snapshot serialization failed"),
        }
    }

    async fn restore_cache(&self) {
        match self.store.get(CACHE_SNAPSHOT_KEY).await {
            Ok(Some(json)) => match serde_json::from_str::<CacheSnapshot>(&json) {
                Ok(snapshot) => {
                    self.cache.restore(snapshot);
                    tracing::info!("cache rehydrated from storage");
                }
                Err(e) => tracing::warn!(error = %e, "persisted cache snapshot unreadable"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "cache rehydration failed"),
        }
    }

    fn session_store_key(key: &ConnectionKey) -> String {
        format!("session:{key}")
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_connection_gauge(&self) {
        metrics::gauge!("broker_sync_active_connections")
            .set(self.connections.read().len() as f64);
    }
}

// =============================================================================
// Connect implementation (Arc receiver: spawned tasks hold the manager)
// =============================================================================

/// Operations that spawn tasks holding the manager alive.
pub trait ManagerConnectExt {
    /// Connect to a broker account, resolving when the connection
    /// reaches `READY`.
    ///
    /// Concurrent calls for the same (broker, account) share one
    /// in-flight attempt: exactly one handshake is initiated and every
    /// caller observes the same resolution. The returned future rejects
    /// when the handshake fails terminally, exceeds its ceiling, or is
    /// cancelled by a disconnect.
    fn connect(
        &self,
        broker_id: &str,
        account_id: &str,
    ) -> BoxFuture<'static, Result<(), ConnectError>>;

    /// Reuse a healthy pooled socket for (broker, environment), falling
    /// back to a fresh connect when none exists.
    fn get_or_create_shared_connection(
        &self,
        broker_id: &str,
        environment: Environment,
        account_id: &str,
    ) -> BoxFuture<'static, Result<(), ConnectError>>;

    /// Close one logical connection; the physical socket closes only
    /// when no other logical connection shares it. Returns whether a
    /// connection existed.
    fn disconnect(&self, broker_id: &str, account_id: &str) -> bool;

    /// Close every connection; each physical socket is closed exactly
    /// once.
    fn disconnect_all(&self);
}

impl ManagerConnectExt for Arc<ConnectionManager> {
    fn connect(
        &self,
        broker_id: &str,
        account_id: &str,
    ) -> BoxFuture<'static, Result<(), ConnectError>> {
        let key = ConnectionKey::new(broker_id, account_id);

        // An already-ready connection resolves immediately.
        if let Some(handle) = self.connections.read().get(&key)
            && handle.connection.is_healthy()
        {
            return async { Ok(()) }.boxed();
        }

        let shared = {
            let mut pending = self.pending.lock();
            if let Some(in_flight) = pending.get(&key) {
                in_flight.clone()
            } else {
                let manager = Arc::clone(self);
                let pending_map = Arc::clone(&self.pending);
                let future_key = key.clone();
                let fresh: ConnectFuture = async move {
                    let result = manager.establish(future_key.clone()).await;
                    pending_map.lock().remove(&future_key);
                    result
                }
                .boxed()
                .shared();
                pending.insert(key, fresh.clone());
                fresh
            }
        };

        async move { shared.await }.boxed()
    }

    fn get_or_create_shared_connection(
        &self,
        broker_id: &str,
        environment: Environment,
        account_id: &str,
    ) -> BoxFuture<'static, Result<(), ConnectError>> {
        let key = ConnectionKey::new(broker_id, account_id);
        let shared_key = SharedConnectionKey::new(broker_id, environment);

        // A live per-account connection always wins over the pool.
        if let Some(handle) = self.connections.read().get(&key)
            && handle.connection.is_healthy()
        {
            return async { Ok(()) }.boxed();
        }

        // Reuse the pooled socket when it is still healthy.
        let pooled = self.shared_pool.read().get(&shared_key).cloned();
        if let Some(owner_key) = pooled {
            let reused = {
                let connections = self.connections.read();
                connections.get(&owner_key).and_then(|handle| {
                    handle.connection.is_healthy().then(|| ConnectionHandle {
                        connection: Arc::clone(&handle.connection),
                        cancel: handle.cancel.clone(),
                    })
                })
            };

            if let Some(handle) = reused {
                tracing::info!(
                    broker = broker_id,
                    environment = environment.as_str(),
                    account = account_id,
                    "reusing shared gateway connection"
                );
                self.connections.write().insert(key.clone(), handle);
                let _ = self.hub.send_state(StateEvent {
                    key,
                    state: ConnectionState::Ready,
                    error: None,
                });
                return async { Ok(()) }.boxed();
            }

            // Stale pool entry.
            self.shared_pool.write().remove(&shared_key);
        }

        let manager = Arc::clone(self);
        let broker = broker_id.to_string();
        let account = account_id.to_string();
        async move {
            manager.connect(&broker, &account).await?;
            manager
                .shared_pool
                .write()
                .insert(shared_key, ConnectionKey::new(broker, account));
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self, broker_id: &str, account_id: &str) -> bool {
        let key = ConnectionKey::new(broker_id, account_id);
        let Some(handle) = self.connections.write().remove(&key) else {
            return false;
        };

        // Drop stale pool entries owned by this key.
        self.shared_pool
            .write()
            .retain(|_, owner| owner != &key);

        // A socket still referenced by another logical connection stays
        // open; only its last holder closes it.
        let still_shared = self
            .connections
            .read()
            .values()
            .any(|other| Arc::ptr_eq(&other.connection, &handle.connection));

        if still_shared {
            tracing::info!(key = %key, "detached from shared connection");
            let _ = self.hub.send_state(StateEvent {
                key: key.clone(),
                state: ConnectionState::Disconnected,
                error: None,
            });
        } else {
            handle.cancel.cancel();
        }

        self.router.connection_closed(&key);
        self.reconciler.set_connection_ready(&key, false);
        self.record_connection_gauge();
        true
    }

    fn disconnect_all(&self) {
        let drained: Vec<(ConnectionKey, ConnectionHandle)> =
            self.connections.write().drain().collect();
        self.shared_pool.write().clear();
        self.pending.lock().clear();

        let mut closed: Vec<Arc<Connection>> = Vec::new();
        for (key, handle) in drained {
            let already_closed = closed
                .iter()
                .any(|connection| Arc::ptr_eq(connection, &handle.connection));
            if !already_closed {
                handle.cancel.cancel();
                closed.push(Arc::clone(&handle.connection));
            }
            self.router.connection_closed(&key);
            self.reconciler.set_connection_ready(&key, false);
        }
        self.record_connection_gauge();
        tracing::info!(count = closed.len(), "all gateway connections closed");
    }
}

impl ConnectionManager {
    /// Build, register, and run a fresh connection, resolving on its
    /// first terminal handshake state.
    async fn establish(self: Arc<Self>, key: ConnectionKey) -> Result<(), ConnectError> {
        let token = self.token_provider.bearer_token().await.map_err(|e| {
            ConnectError::Handshake(HandshakeError::AuthenticationRejected(e.to_string()))
        })?;

        let session = self
            .store
            .get(&Self::session_store_key(&key))
            .await
            .ok()
            .flatten();

        let url = self
            .config
            .gateway_url(&key.broker_id, &key.account_id, &token);

        let cancel = self.shutdown.child_token();
        let (event_tx, event_rx) = mpsc::channel(1024);

        let ws = &self.config.websocket;
        let connection = Connection::new(
            ConnectionConfig {
                key: key.clone(),
                url,
                heartbeat: HeartbeatConfig::new(ws.heartbeat_interval, ws.heartbeat_timeout),
                reconnect: ReconnectConfig {
                    initial_delay: ws.reconnect_delay_initial,
                    max_delay: ws.reconnect_delay_max,
                    multiplier: ws.reconnect_delay_multiplier,
                    jitter_factor: 0.1,
                    max_attempts: ws.max_reconnect_attempts,
                },
                handshake_timeout: ws.handshake_timeout,
                outbound_capacity: ws.outbound_capacity,
            },
            session,
            event_tx,
            cancel.clone(),
        );

        // Replace any dead prior registration.
        if let Some(previous) = self.connections.write().insert(
            key.clone(),
            ConnectionHandle {
                connection: Arc::clone(&connection),
                cancel,
            },
        ) {
            previous.cancel.cancel();
        }
        self.record_connection_gauge();

        let pump_manager = Arc::clone(&self);
        let pump_key = key.clone();
        tokio::spawn(async move { pump_manager.pump_events(pump_key, event_rx).await });

        let runner = Arc::clone(&connection);
        let run_key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                tracing::error!(key = %run_key, error = %e, "connection terminated");
            }
        });

        connection.wait_ready().await
    }

    /// Consume one connection's event stream.
    async fn pump_events(
        self: Arc<Self>,
        key: ConnectionKey,
        mut event_rx: mpsc::Receiver<ConnectionEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            match event {
                ConnectionEvent::StateChanged { state, error } => {
                    self.reconciler.set_connection_ready(&key, state.is_ready());
                    tracing::debug!(key = %key, state = state.as_str(), "connection state");
                    let _ = self.hub.send_state(StateEvent {
                        key: key.clone(),
                        state,
                        error,
                    });
                }
                ConnectionEvent::SessionAssigned(session_id) => {
                    if let Err(e) = self
                        .store
                        .put(&Self::session_store_key(&key), &session_id)
                        .await
                    {
                        tracing::warn!(key = %key, error = %e, "session persistence failed");
                    }
                }
                ConnectionEvent::Reconnecting { attempt } => {
                    tracing::info!(key = %key, attempt, "gateway reconnect scheduled");
                }
                ConnectionEvent::Message(message) => {
                    self.dispatch_data(&key, &message);
                }
            }
        }
        tracing::debug!(key = %key, "event pump finished");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::application::ports::{MockKeyValueStore, MockTokenProvider};
    use crate::infrastructure::storage::FileStore;

    use super::*;

    fn manager_with_store(store: Arc<dyn KeyValueStore>) -> Arc<ConnectionManager> {
        let mut token_provider = MockTokenProvider::new();
        token_provider
            .expect_bearer_token()
            .returning(|| Ok("jwt".to_string()));
        ConnectionManager::new(SyncConfig::default(), Arc::new(token_provider), store)
    }

    fn manager() -> Arc<ConnectionManager> {
        let mut store = MockKeyValueStore::new();
        store.expect_get().returning(|_| Ok(None));
        store.expect_put().returning(|_, _| Ok(()));
        store.expect_delete().returning(|_| Ok(()));
        manager_with_store(Arc::new(store))
    }

    fn msg(json: &str) -> GatewayMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn unknown_connection_reports_disconnected() {
        let manager = manager();
        assert_eq!(
            manager.connection_state("tradovate", "123"),
            ConnectionState::Disconnected
        );
        assert!(!manager.is_connected("tradovate", "123"));
    }

    #[test]
    fn disconnect_unknown_connection_is_false() {
        let manager = manager();
        assert!(!manager.disconnect("tradovate", "123"));
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let manager = manager();
        let result = manager
            .send_message(
                "tradovate",
                "123",
                ClientMessage::GetPositions,
                RateCategory::Default,
            )
            .await;
        assert!(matches!(result, Err(ManagerError::NotConnected(_))));
    }

    #[tokio::test]
    async fn dispatch_market_data_caches_and_broadcasts() {
        let manager = manager();
        let key = ConnectionKey::new("tradovate", "123");
        let mut rx = manager.hub().market_data_rx();

        manager.dispatch_data(
            &key,
            &msg(r#"{"type": "market_data", "data": {"symbol": "NQH6", "price": 100, "bid": 99}}"#),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.symbol, "NQH6");
        assert!(manager.get_market_data("NQH6").is_some());
    }

    #[tokio::test]
    async fn dispatch_user_data_populates_all_caches() {
        let manager = manager();
        let key = ConnectionKey::new("tradovate", "123");

        manager.dispatch_data(
            &key,
            &msg(
                r#"{"type": "user_data", "data": {
                    "accounts": [{"nickname": "Main", "balance": 1000}],
                    "positions": [{"id": 55, "netPos": 2, "netPrice": 100, "symbol": "NQH6"}],
                    "orders": [{"orderId": 9001, "symbol": "NQH6", "orderQty": 1}]
                }}"#,
            ),
        );

        assert!(manager.get_account_data("tradovate", "123").is_some());
        assert_eq!(manager.get_orders("tradovate", "123").len(), 1);
        let positions = manager.get_positions("tradovate", "123");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].position_id, "55");
        // Reconciler sees the same set.
        assert_eq!(manager.reconciler().positions(&key).len(), 1);
    }

    #[tokio::test]
    async fn malformed_order_update_does_not_panic() {
        let manager = manager();
        let key = ConnectionKey::new("tradovate", "123");
        manager.dispatch_data(&key, &msg(r#"{"type": "order_update", "data": {}}"#));
        assert!(manager.get_orders("tradovate", "123").is_empty());
    }

    #[tokio::test]
    async fn cache_round_trips_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("state.json")));

        let manager = manager_with_store(Arc::clone(&store) as Arc<dyn KeyValueStore>);
        let key = ConnectionKey::new("tradovate", "123");
        manager.dispatch_data(
            &key,
            &msg(r#"{"type": "market_data", "data": {"symbol": "NQH6", "price": 100}}"#),
        );
        manager.persist_cache().await;

        let rehydrated = manager_with_store(Arc::clone(&store) as Arc<dyn KeyValueStore>);
        rehydrated.restore_cache().await;

        assert_eq!(
            rehydrated.get_market_data("NQH6"),
            manager.get_market_data("NQH6")
        );
    }

    #[tokio::test]
    async fn clear_cache_wipes_live_and_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("state.json")));

        let manager = manager_with_store(Arc::clone(&store) as Arc<dyn KeyValueStore>);
        let key = ConnectionKey::new("tradovate", "123");
        manager.dispatch_data(
            &key,
            &msg(r#"{"type": "market_data", "data": {"symbol": "NQH6", "price": 100}}"#),
        );
        manager.persist_cache().await;

        manager.clear_cache().await.unwrap();

        assert!(manager.get_market_data("NQH6").is_none());
        assert!(store.get(CACHE_SNAPSHOT_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let manager = manager();

        // Point at a dead address so the attempt stays in flight briefly.
        let first = manager.connect("tradovate", "123");
        let second = manager.connect("tradovate", "123");

        let first_task = tokio::spawn(first);
        let second_task = tokio::spawn(second);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.pending.lock().len(), 1, "one in-flight attempt");

        // Disconnect settles both callers with the same resolution.
        manager.disconnect("tradovate", "123");
        let first_result = first_task.await.unwrap();
        let second_result = second_task.await.unwrap();
        assert!(matches!(first_result, Err(ConnectError::Cancelled)));
        assert!(matches!(second_result, Err(ConnectError::Cancelled)));
    }

    #[tokio::test]
    async fn subscribe_without_connection_surfaces_send_error() {
        let manager = manager();
        let result = manager
            .subscribe_market_data("tradovate", "123", "NQH6", SubscriptionType::Quote)
            .await;
        assert!(matches!(result, Err(ManagerError::NotConnected(_))));

        // Interest was still registered; a second subscriber needs no
        // upstream traffic and therefore succeeds.
        let result = manager
            .subscribe_market_data("tradovate", "456", "NQH6", SubscriptionType::Quote)
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn shared_pool_keys_differ_by_environment() {
        let demo = SharedConnectionKey::new("tradovate", Environment::Demo);
        let live = SharedConnectionKey::new("tradovate", Environment::Live);
        assert_ne!(demo, live);
    }

    #[test]
    fn session_store_key_shape() {
        let key = ConnectionKey::new("tradovate", "123");
        assert_eq!(
            ConnectionManager::session_store_key(&key),
            "session:tradovate:123"
        );
    }
}
