//! Canonical Position Model and Ingress Normalization
//!
//! Broker gateways disagree about payload shapes: the same position may
//! arrive with `positionId` or `id`, `netPos` or `qty`, `netPrice` or
//! `avgPrice`. All raw shapes are decoded into one tolerant payload type
//! and normalized exactly once, at the ingress boundary. Everything past
//! that boundary works with the canonical types in this module.
//!
//! # Identity
//!
//! Position identity is stable across snapshot/opened/closed/updated/price
//! events and resolves in priority order: `positionId`, then `contractId`,
//! then `symbol`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Error Type
// =============================================================================

/// Errors produced while normalizing raw gateway payloads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NormalizeError {
    /// The payload carried no usable identity field.
    #[error("position payload has no positionId, contractId, or symbol")]
    MissingIdentity,

    /// The payload carried no usable order identity.
    #[error("order payload has no orderId or id")]
    MissingOrderId,
}

// =============================================================================
// Canonical Types
// =============================================================================

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Net long.
    Long,
    /// Net short.
    Short,
}

impl Side {
    /// Derive a side from the sign of a net-position quantity.
    ///
    /// Returns `None` for a flat (zero) quantity.
    #[must_use]
    pub fn from_net_quantity(net: Decimal) -> Option<Self> {
        if net.is_zero() {
            None
        } else if net > Decimal::ZERO {
            Some(Self::Long)
        } else {
            Some(Self::Short)
        }
    }
}

/// A normalized open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Stable identity (positionId → contractId → symbol fallback).
    pub position_id: String,
    /// Broker this position belongs to.
    pub broker_id: String,
    /// Account this position belongs to.
    pub account_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Long or short.
    pub side: Side,
    /// Absolute quantity.
    pub quantity: Decimal,
    /// Average entry price.
    pub avg_price: Decimal,
    /// Last observed price, if any.
    pub current_price: Option<Decimal>,
    /// Unrealized profit and loss.
    pub unrealized_pnl: Option<Decimal>,
    /// Realized profit and loss.
    pub realized_pnl: Option<Decimal>,
    /// Time of the most recent mutation.
    pub updated_at: DateTime<Utc>,
}

/// A normalized working or historical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Gateway order identifier.
    pub order_id: String,
    /// Broker this order belongs to.
    pub broker_id: String,
    /// Account this order belongs to.
    pub account_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy/Sell action as reported by the gateway.
    pub action: String,
    /// Order type (Market, Limit, ...).
    pub order_type: String,
    /// Ordered quantity.
    pub quantity: Decimal,
    /// Quantity filled so far.
    pub filled_quantity: Decimal,
    /// Limit price, when applicable.
    pub limit_price: Option<Decimal>,
    /// Stop price, when applicable.
    pub stop_price: Option<Decimal>,
    /// Average fill price, when any fill exists.
    pub avg_fill_price: Option<Decimal>,
    /// Gateway order status string.
    pub status: String,
    /// Time of the most recent mutation.
    pub updated_at: DateTime<Utc>,
}

/// A normalized account summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Broker identifier.
    pub broker_id: String,
    /// Account identifier.
    pub account_id: String,
    /// Display name, when the gateway supplies one.
    pub name: Option<String>,
    /// Cash balance.
    pub balance: Option<Decimal>,
    /// Account equity.
    pub equity: Option<Decimal>,
    /// Open (unrealized) profit and loss.
    pub unrealized_pnl: Option<Decimal>,
    /// Margin currently in use.
    pub margin_used: Option<Decimal>,
    /// Time of the most recent mutation.
    pub updated_at: DateTime<Utc>,
}

/// A normalized market data tick for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    /// Instrument symbol.
    pub symbol: String,
    /// Last trade price.
    pub price: Option<Decimal>,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Session volume.
    pub volume: Option<Decimal>,
    /// Time of the most recent tick.
    pub updated_at: DateTime<Utc>,
}

impl MarketData {
    /// Merge a newer tick over this one, keeping fields the newer tick omits.
    pub fn merge_from(&mut self, newer: &Self) {
        if newer.price.is_some() {
            self.price = newer.price;
        }
        if newer.bid.is_some() {
            self.bid = newer.bid;
        }
        if newer.ask.is_some() {
            self.ask = newer.ask;
        }
        if newer.volume.is_some() {
            self.volume = newer.volume;
        }
        self.updated_at = newer.updated_at;
    }
}

// =============================================================================
// Raw Gateway Payloads
// =============================================================================

/// Raw position payload tolerating every field spelling the gateways use.
///
/// Decoded straight off the wire; converted to [`Position`] via
/// [`RawPositionPayload::normalize`] and never used past ingress.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawPositionPayload {
    /// Position identifier (`positionId` or `id`).
    #[serde(alias = "positionId")]
    pub position_id: Option<serde_json::Value>,
    /// Generic identifier used by some gateways.
    pub id: Option<serde_json::Value>,
    /// Contract identifier.
    #[serde(alias = "contractId")]
    pub contract_id: Option<serde_json::Value>,
    /// Instrument symbol.
    pub symbol: Option<String>,
    /// Explicit side string, when present (`LONG`/`SHORT`).
    pub side: Option<Side>,
    /// Signed net position quantity.
    #[serde(alias = "netPos")]
    pub net_pos: Option<Decimal>,
    /// Unsigned quantity used by some gateways.
    #[serde(alias = "qty")]
    pub quantity: Option<Decimal>,
    /// Average entry price (`netPrice` spelling).
    #[serde(alias = "netPrice")]
    pub net_price: Option<Decimal>,
    /// Average entry price (`avgPrice` spelling).
    #[serde(alias = "avgPrice", alias = "averagePrice")]
    pub avg_price: Option<Decimal>,
    /// Last observed price.
    #[serde(alias = "currentPrice")]
    pub current_price: Option<Decimal>,
    /// Unrealized PnL (`unrealizedPnL`, `pl`, or `openPL`).
    #[serde(alias = "unrealizedPnL", alias = "pl", alias = "openPL")]
    pub unrealized_pnl: Option<Decimal>,
    /// Realized PnL.
    #[serde(alias = "realizedPnL")]
    pub realized_pnl: Option<Decimal>,
}

impl RawPositionPayload {
    /// Resolve the stable identity key: positionId → contractId → symbol.
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        self.position_id
            .as_ref()
            .or(self.id.as_ref())
            .or(self.contract_id.as_ref())
            .map(value_to_key)
            .or_else(|| self.symbol.clone())
    }

    /// Signed net quantity, from whichever field the gateway populated.
    ///
    /// When only an unsigned quantity is present, the explicit side (if
    /// any) restores the sign.
    #[must_use]
    pub fn net_quantity(&self) -> Decimal {
        if let Some(net) = self.net_pos {
            return net;
        }
        let qty = self.quantity.unwrap_or_default();
        match self.side {
            Some(Side::Short) => -qty.abs(),
            _ => qty,
        }
    }

    /// Whether this payload describes a flat (closed) position.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.net_quantity().is_zero()
    }

    /// Normalize into the canonical [`Position`] model.
    ///
    /// Side comes from the explicit field when present, otherwise from the
    /// sign of the net quantity; quantity is its absolute value.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError::MissingIdentity`] when no identity field
    /// is usable. A flat payload normalizes with side defaulted to `Long`
    /// and zero quantity; callers treat it as a close.
    pub fn normalize(
        &self,
        broker_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Position, NormalizeError> {
        let position_id = self.identity().ok_or(NormalizeError::MissingIdentity)?;
        let net = self.net_quantity();
        let side = self
            .side
            .or_else(|| Side::from_net_quantity(net))
            .unwrap_or(Side::Long);

        Ok(Position {
            position_id,
            broker_id: broker_id.to_string(),
            account_id: account_id.to_string(),
            symbol: self.symbol.clone().unwrap_or_default(),
            side,
            quantity: net.abs(),
            avg_price: self.net_price.or(self.avg_price).unwrap_or_default(),
            current_price: self.current_price,
            unrealized_pnl: self.unrealized_pnl,
            realized_pnl: self.realized_pnl,
            updated_at: now,
        })
    }
}

/// Raw order payload tolerating every field spelling the gateways use.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawOrderPayload {
    /// Order identifier (`orderId` or `id`).
    #[serde(alias = "orderId")]
    pub order_id: Option<serde_json::Value>,
    /// Generic identifier used by some gateways.
    pub id: Option<serde_json::Value>,
    /// Instrument symbol.
    pub symbol: Option<String>,
    /// Buy/Sell action (`action` or `side`).
    #[serde(alias = "side")]
    pub action: Option<String>,
    /// Order type string.
    #[serde(alias = "orderType", alias = "type")]
    pub order_type: Option<String>,
    /// Ordered quantity (`orderQty` or `qty`).
    #[serde(alias = "orderQty", alias = "qty")]
    pub quantity: Option<Decimal>,
    /// Filled quantity.
    #[serde(alias = "filledQty")]
    pub filled_quantity: Option<Decimal>,
    /// Limit price (`price` or `limitPrice`).
    #[serde(alias = "price", alias = "limitPrice")]
    pub limit_price: Option<Decimal>,
    /// Stop price.
    #[serde(alias = "stopPrice")]
    pub stop_price: Option<Decimal>,
    /// Average fill price (`avgFillPrice` or `avgPrice`).
    #[serde(alias = "avgFillPrice", alias = "avgPrice")]
    pub avg_fill_price: Option<Decimal>,
    /// Gateway status string (`orderStatus` or `status`).
    #[serde(alias = "orderStatus", alias = "status")]
    pub order_status: Option<String>,
}

impl RawOrderPayload {
    /// Resolve the order identity: orderId → id.
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        self.order_id
            .as_ref()
            .or(self.id.as_ref())
            .map(value_to_key)
    }

    /// Normalize into the canonical [`Order`] model.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError::MissingOrderId`] when no identity field
    /// is usable.
    pub fn normalize(
        &self,
        broker_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Order, NormalizeError> {
        let order_id = self.identity().ok_or(NormalizeError::MissingOrderId)?;

        Ok(Order {
            order_id,
            broker_id: broker_id.to_string(),
            account_id: account_id.to_string(),
            symbol: self.symbol.clone().unwrap_or_default(),
            action: self.action.clone().unwrap_or_default(),
            order_type: self
                .order_type
                .clone()
                .unwrap_or_else(|| "Market".to_string()),
            quantity: self.quantity.unwrap_or_default(),
            filled_quantity: self.filled_quantity.unwrap_or_default(),
            limit_price: self.limit_price,
            stop_price: self.stop_price,
            avg_fill_price: self.avg_fill_price,
            status: self
                .order_status
                .clone()
                .unwrap_or_else(|| "Working".to_string()),
            updated_at: now,
        })
    }
}

/// Raw account payload.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawAccountPayload {
    /// Account identifier, when the gateway echoes it.
    #[serde(alias = "accountId")]
    pub account_id: Option<serde_json::Value>,
    /// Display name (`name` or `nickname`).
    #[serde(alias = "nickname")]
    pub name: Option<String>,
    /// Cash balance (`balance` or `cashBalance`).
    #[serde(alias = "cashBalance")]
    pub balance: Option<Decimal>,
    /// Account equity.
    pub equity: Option<Decimal>,
    /// Open PnL (`unrealizedPnL` or `openPL`).
    #[serde(alias = "unrealizedPnL", alias = "openPL")]
    pub unrealized_pnl: Option<Decimal>,
    /// Margin in use.
    #[serde(alias = "marginUsed")]
    pub margin_used: Option<Decimal>,
}

impl RawAccountPayload {
    /// Normalize into the canonical [`AccountSnapshot`] model.
    ///
    /// The connection's account id is authoritative; the payload's own
    /// `accountId` field is advisory only.
    #[must_use]
    pub fn normalize(
        &self,
        broker_id: &str,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> AccountSnapshot {
        AccountSnapshot {
            broker_id: broker_id.to_string(),
            account_id: account_id.to_string(),
            name: self.name.clone(),
            balance: self.balance,
            equity: self.equity,
            unrealized_pnl: self.unrealized_pnl,
            margin_used: self.margin_used,
            updated_at: now,
        }
    }
}

/// Raw market data payload.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RawMarketDataPayload {
    /// Instrument symbol.
    pub symbol: Option<String>,
    /// Last trade price (`price` or `last`).
    #[serde(alias = "last")]
    pub price: Option<Decimal>,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Session volume.
    pub volume: Option<Decimal>,
}

impl RawMarketDataPayload {
    /// Normalize into the canonical [`MarketData`] model.
    ///
    /// Returns `None` when the payload has no symbol to key on.
    #[must_use]
    pub fn normalize(&self, now: DateTime<Utc>) -> Option<MarketData> {
        let symbol = self.symbol.clone()?;
        Some(MarketData {
            symbol,
            price: self.price,
            bid: self.bid,
            ask: self.ask,
            volume: self.volume,
            updated_at: now,
        })
    }
}

/// Normalize a JSON identity value (string or number) into a map key.
fn value_to_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
