//! Layered TTL Cache
//!
//! In-memory read-side state for market data, accounts, positions, and
//! orders. Live reads never consult TTLs: an expired entry is still
//! returned until something overwrites or removes it. Expiry only
//! governs which entries survive a persistence snapshot/restore cycle.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::position::{AccountSnapshot, MarketData, Order, Position};
use crate::domain::subscription::ConnectionKey;
use crate::infrastructure::config::CacheSettings;

// =============================================================================
// Entries
// =============================================================================

/// One cached value plus its freshness timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub value: T,
    /// When the value was last written.
    pub updated_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// Create an entry stamped with the given time.
    pub const fn new(value: T, updated_at: DateTime<Utc>) -> Self {
        Self { value, updated_at }
    }

    /// Whether this entry is past its TTL at `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map_or(false, |age| age > ttl)
    }
}

/// Serializable snapshot of all non-expired cache entries.
///
/// `BTreeMap` keys make the persisted form independent of in-memory map
/// ordering, so snapshot → restore → snapshot is byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Market data by symbol.
    pub market_data: BTreeMap<String, CacheEntry<MarketData>>,
    /// Account data by `broker:account`.
    pub account_data: BTreeMap<String, CacheEntry<AccountSnapshot>>,
    /// Positions by `broker:account:positionId`.
    pub positions: BTreeMap<String, CacheEntry<Position>>,
    /// Orders by `broker:account:orderId`.
    pub orders: BTreeMap<String, CacheEntry<Order>>,
}

// =============================================================================
// Cache
// =============================================================================

/// The process-wide read cache, mutated only by the connection manager
/// and the reconciler.
#[derive(Debug)]
pub struct DataCache {
    settings: CacheSettings,
    market_data: RwLock<HashMap<String, CacheEntry<MarketData>>>,
    account_data: RwLock<HashMap<String, CacheEntry<AccountSnapshot>>>,
    positions: RwLock<HashMap<String, CacheEntry<Position>>>,
    orders: RwLock<HashMap<String, CacheEntry<Order>>>,
}

impl DataCache {
    /// Create an empty cache with the given TTL settings.
    #[must_use]
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            market_data: RwLock::new(HashMap::new()),
            account_data: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Market data
    // =========================================================================

    /// Merge a tick over the cached value for its symbol and return the
    /// merged result.
    pub fn upsert_market_data(&self, data: MarketData) -> MarketData {
        let mut map = self.market_data.write();
        let updated_at = data.updated_at;
        let merged = match map.get(&data.symbol) {
            Some(existing) => {
                let mut merged = existing.value.clone();
                merged.merge_from(&data);
                merged
            }
            None => data,
        };
        map.insert(
            merged.symbol.clone(),
            CacheEntry::new(merged.clone(), updated_at),
        );
        merged
    }

    /// Live market data for a symbol.
    #[must_use]
    pub fn market_data(&self, symbol: &str) -> Option<MarketData> {
        self.market_data.read().get(symbol).map(|e| e.value.clone())
    }

    /// All live market data values.
    #[must_use]
    pub fn all_market_data(&self) -> Vec<MarketData> {
        self.market_data
            .read()
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    // =========================================================================
    // Account data
    // =========================================================================

    /// Store an account snapshot.
    pub fn upsert_account(&self, account: AccountSnapshot) {
        let key = format!("{}:{}", account.broker_id, account.account_id);
        let updated_at = account.updated_at;
        self.account_data
            .write()
            .insert(key, CacheEntry::new(account, updated_at));
    }

    /// Live account data for one connection key.
    #[must_use]
    pub fn account_data(&self, key: &ConnectionKey) -> Option<AccountSnapshot> {
        self.account_data
            .read()
            .get(&key.to_string())
            .map(|e| e.value.clone())
    }

    /// All live account data values.
    #[must_use]
    pub fn all_account_data(&self) -> Vec<AccountSnapshot> {
        self.account_data
            .read()
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Store a position.
    pub fn upsert_position(&self, position: Position) {
        let key = format!(
            "{}:{}:{}",
            position.broker_id, position.account_id, position.position_id
        );
        let updated_at = position.updated_at;
        self.positions
            .write()
            .insert(key, CacheEntry::new(position, updated_at));
    }

    /// Remove a position.
    pub fn remove_position(&self, key: &ConnectionKey, position_id: &str) {
        self.positions
            .write()
            .remove(&format!("{key}:{position_id}"));
    }

    /// Replace every cached position for one account.
    pub fn replace_positions(&self, key: &ConnectionKey, positions: &[Position]) {
        let prefix = format!("{key}:");
        let mut map = self.positions.write();
        map.retain(|k, _| !k.starts_with(&prefix));
        for position in positions {
            let entry_key = format!("{key}:{}", position.position_id);
            map.insert(
                entry_key,
                CacheEntry::new(position.clone(), position.updated_at),
            );
        }
    }

    /// Live positions for one account.
    #[must_use]
    pub fn positions(&self, key: &ConnectionKey) -> Vec<Position> {
        let prefix = format!("{key}:");
        self.positions
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e.value.clone())
            .collect()
    }

    /// All live positions.
    #[must_use]
    pub fn all_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Store an order.
    pub fn upsert_order(&self, order: Order) {
        let key = format!("{}:{}:{}", order.broker_id, order.account_id, order.order_id);
        let updated_at = order.updated_at;
        self.orders
            .write()
            .insert(key, CacheEntry::new(order, updated_at));
    }

    /// Live orders for one account.
    #[must_use]
    pub fn orders(&self, key: &ConnectionKey) -> Vec<Order> {
        let prefix = format!("{key}:");
        self.orders
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e.value.clone())
            .collect()
    }

    /// All live orders.
    #[must_use]
    pub fn all_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Snapshot every non-expired entry for persistence.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> CacheSnapshot {
        CacheSnapshot {
            market_data: Self::collect_fresh(
                &self.market_data.read(),
                self.settings.market_data_ttl,
                now,
            ),
            account_data: Self::collect_fresh(
                &self.account_data.read(),
                self.settings.account_data_ttl,
                now,
            ),
            positions: Self::collect_fresh(
                &self.positions.read(),
                self.settings.positions_ttl,
                now,
            ),
            orders: Self::collect_fresh(&self.orders.read(), self.settings.orders_ttl, now),
        }
    }

    /// Rehydrate from a persisted snapshot, replacing current contents.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        *self.market_data.write() = snapshot.market_data.into_iter().collect();
        *self.account_data.write() = snapshot.account_data.into_iter().collect();
        *self.positions.write() = snapshot.positions.into_iter().collect();
        *self.orders.write() = snapshot.orders.into_iter().collect();
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.market_data.write().clear();
        self.account_data.write().clear();
        self.positions.write().clear();
        self.orders.write().clear();
    }

    fn collect_fresh<T: Clone>(
        map: &HashMap<String, CacheEntry<T>>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, CacheEntry<T>> {
        map.iter()
            .filter(|(_, entry)| !entry.is_expired(ttl, now))
            .map(|(k, entry)| (k.clone(), entry.clone()))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use rust_decimal::Decimal;

    use crate::domain::position::Side;

    use super::*;

    fn cache() -> DataCache {
        DataCache::new(CacheSettings::default())
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("tradovate", "123")
    }

    fn position(id: &str, at: DateTime<Utc>) -> Position {
        Position {
            position_id: id.to_string(),
            broker_id: "tradovate".to_string(),
            account_id: "123".to_string(),
            symbol: "NQH6".to_string(),
            side: Side::Long,
            quantity: Decimal::new(2, 0),
            avg_price: Decimal::new(100, 0),
            current_price: None,
            unrealized_pnl: Some(Decimal::new(50, 0)),
            realized_pnl: None,
            updated_at: at,
        }
    }

    fn tick(symbol: &str, price: i64, at: DateTime<Utc>) -> MarketData {
        MarketData {
            symbol: symbol.to_string(),
            price: Some(Decimal::new(price, 0)),
            bid: None,
            ask: None,
            volume: None,
            updated_at: at,
        }
    }

    #[test]
    fn market_data_merges_over_cached() {
        let cache = cache();
        let now = Utc::now();

        let mut first = tick("NQH6", 100, now);
        first.bid = Some(Decimal::new(99, 0));
        cache.upsert_market_data(first);
        cache.upsert_market_data(tick("NQH6", 102, now));

        let merged = cache.market_data("NQH6").unwrap();
        assert_eq!(merged.price, Some(Decimal::new(102, 0)));
        assert_eq!(merged.bid, Some(Decimal::new(99, 0)));
    }

    #[test]
    fn positions_are_scoped_per_account() {
        let cache = cache();
        let now = Utc::now();

        cache.upsert_position(position("55", now));
        let mut other = position("55", now);
        other.account_id = "456".to_string();
        cache.upsert_position(other);

        assert_eq!(cache.positions(&key()).len(), 1);
        assert_eq!(cache.all_positions().len(), 2);
    }

    #[test]
    fn replace_positions_drops_missing_entries() {
        let cache = cache();
        let now = Utc::now();

        cache.upsert_position(position("55", now));
        cache.upsert_position(position("56", now));

        cache.replace_positions(&key(), &[position("55", now)]);

        let ids: Vec<_> = cache
            .positions(&key())
            .into_iter()
            .map(|p| p.position_id)
            .collect();
        assert_eq!(ids, vec!["55".to_string()]);
    }

    #[test]
    fn remove_position_targets_one_entry() {
        let cache = cache();
        let now = Utc::now();

        cache.upsert_position(position("55", now));
        cache.upsert_position(position("56", now));
        cache.remove_position(&key(), "55");

        let ids: Vec<_> = cache
            .positions(&key())
            .into_iter()
            .map(|p| p.position_id)
            .collect();
        assert_eq!(ids, vec!["56".to_string()]);
    }

    #[test]
    fn live_reads_ignore_ttl() {
        let cache = cache();
        let stale = Utc::now() - TimeDelta::hours(2);

        cache.upsert_market_data(tick("NQH6", 100, stale));

        // Expired for persistence purposes, but still served live.
        assert!(cache.market_data("NQH6").is_some());
    }

    #[test]
    fn snapshot_filters_expired_entries() {
        let cache = cache();
        let now = Utc::now();
        let stale = now - TimeDelta::hours(2);

        cache.upsert_market_data(tick("FRESH", 100, now));
        cache.upsert_market_data(tick("STALE", 100, stale));
        cache.upsert_position(position("55", stale));

        let snapshot = cache.snapshot(now);

        assert!(snapshot.market_data.contains_key("FRESH"));
        assert!(!snapshot.market_data.contains_key("STALE"));
        assert!(snapshot.positions.is_empty());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let cache = cache();
        let now = Utc::now();

        cache.upsert_market_data(tick("NQH6", 100, now));
        cache.upsert_position(position("55", now));
        cache.upsert_account(AccountSnapshot {
            broker_id: "tradovate".to_string(),
            account_id: "123".to_string(),
            name: Some("Main".to_string()),
            balance: Some(Decimal::new(50_000, 0)),
            equity: None,
            unrealized_pnl: None,
            margin_used: None,
            updated_at: now,
        });

        let snapshot = cache.snapshot(now);
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: CacheSnapshot = serde_json::from_str(&json).unwrap();

        let restored = DataCache::new(CacheSettings::default());
        restored.restore(parsed);

        assert_eq!(restored.market_data("NQH6"), cache.market_data("NQH6"));
        assert_eq!(restored.positions(&key()), cache.positions(&key()));
        assert_eq!(restored.account_data(&key()), cache.account_data(&key()));
        // A second snapshot of the restored cache is identical.
        assert_eq!(restored.snapshot(now), snapshot);
    }

    #[test]
    fn clear_wipes_everything() {
        let cache = cache();
        let now = Utc::now();

        cache.upsert_market_data(tick("NQH6", 100, now));
        cache.upsert_position(position("55", now));
        cache.clear();

        assert!(cache.market_data("NQH6").is_none());
        assert!(cache.all_positions().is_empty());
    }

    #[test]
    fn entry_expiry_math() {
        let now = Utc::now();
        let entry = CacheEntry::new(1u32, now - TimeDelta::seconds(90));

        assert!(entry.is_expired(Duration::from_secs(60), now));
        assert!(!entry.is_expired(Duration::from_secs(120), now));

        // An entry stamped in the future is never expired.
        let future = CacheEntry::new(1u32, now + TimeDelta::seconds(60));
        assert!(!future.is_expired(Duration::from_secs(1), now));
    }
}
