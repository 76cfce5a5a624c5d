//! Gateway Wire Protocol
//!
//! JSON messages exchanged with a broker gateway over the WebSocket.
//! Inbound and outbound traffic are modeled as two enums tagged by the
//! `type` field, so an unknown or malformed message fails at the decode
//! boundary instead of deep inside a handler.
//!
//! # Inbound taxonomy
//!
//! Control: `connection_test` (requires an echo reply),
//! `connection_established`, `validation_progress`, `connection_state`,
//! `connection_ready`, `session_info`, `ping`/`pong`.
//!
//! Data: `user_data` (initial sync), the `position_*` event family,
//! `account_update`, `order_update`, `market_data`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::position::{
    RawAccountPayload, RawMarketDataPayload, RawOrderPayload, RawPositionPayload,
};

// =============================================================================
// Inbound Messages
// =============================================================================

/// Initial sync payload delivered once the broker link is up.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UserDataPayload {
    /// Account summaries.
    pub accounts: Vec<RawAccountPayload>,
    /// Open positions.
    pub positions: Vec<RawPositionPayload>,
    /// Working orders.
    pub orders: Vec<RawOrderPayload>,
    /// Contract metadata, passed through untouched.
    pub contracts: Vec<serde_json::Value>,
}

/// A message received from the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Liveness probe from the server; must be answered with
    /// [`ClientMessage::ConnectionTestResponse`].
    ConnectionTest,

    /// Socket accepted; server-side validation is about to begin.
    ConnectionEstablished {
        /// Optional status text.
        #[serde(default)]
        message: Option<String>,
    },

    /// A handshake phase is in progress.
    ValidationProgress {
        /// Phase identifier (`validating_user`, `checking_subscription`,
        /// `checking_broker_access`, `connecting_to_broker`).
        status: String,
        /// Optional status text.
        #[serde(default)]
        message: Option<String>,
    },

    /// A handshake phase settled (or failed).
    ConnectionState {
        /// Confirmation identifier (`authenticated`,
        /// `subscription_verified`, `broker_connected`, `ready`, `error`).
        state: String,
        /// Optional status text.
        #[serde(default)]
        message: Option<String>,
        /// Error detail when `state` is `error`.
        #[serde(default)]
        error: Option<String>,
    },

    /// The gateway declared the connection fully ready.
    ConnectionReady,

    /// Session resumption token assignment.
    SessionInfo {
        /// Token to replay on reconnect.
        session_id: String,
    },

    /// Application-level ping; must be answered with a pong.
    Ping,

    /// Application-level pong.
    Pong,

    /// Initial account/position/order sync.
    UserData {
        /// Sync payload.
        data: UserDataPayload,
    },

    /// A position was opened.
    PositionOpened {
        /// Raw position payload.
        data: RawPositionPayload,
    },

    /// A position was closed.
    PositionClosed {
        /// Raw position payload.
        data: RawPositionPayload,
    },

    /// A position was modified (quantity, stops, ...).
    #[serde(alias = "position_update")]
    PositionUpdated {
        /// Raw position payload.
        data: RawPositionPayload,
    },

    /// High-frequency price tick for one position.
    PositionPriceUpdate {
        /// Raw position payload.
        data: RawPositionPayload,
    },

    /// High-frequency PnL tick for one position.
    PositionPnlUpdate {
        /// Raw position payload.
        data: RawPositionPayload,
    },

    /// Full replacement set of positions for the account.
    PositionsSnapshot {
        /// Raw position payloads.
        data: Vec<RawPositionPayload>,
    },

    /// Account balance/equity change.
    AccountUpdate {
        /// Raw account payload.
        data: RawAccountPayload,
    },

    /// Order lifecycle change.
    OrderUpdate {
        /// Raw order payload.
        data: RawOrderPayload,
    },

    /// Market data tick.
    MarketData {
        /// Raw market data payload.
        data: RawMarketDataPayload,
    },

    /// Anything this client version does not understand.
    #[serde(other)]
    Unknown,
}

// =============================================================================
// Outbound Messages
// =============================================================================

/// Order submission payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// Client-generated correlation id.
    pub client_order_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or Sell.
    pub action: String,
    /// Order type (Market, Limit, Stop, `StopLimit`).
    pub order_type: String,
    /// Quantity to trade.
    pub quantity: Decimal,
    /// Limit price, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// Stop price, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    /// Time in force (GTC, DAY).
    pub time_in_force: String,
}

impl OrderRequest {
    /// Create a market order request with a fresh client order id.
    #[must_use]
    pub fn market(symbol: impl Into<String>, action: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            action: action.into(),
            order_type: "Market".to_string(),
            quantity,
            limit_price: None,
            stop_price: None,
            time_in_force: "DAY".to_string(),
        }
    }

    /// Create a limit order request with a fresh client order id.
    #[must_use]
    pub fn limit(
        symbol: impl Into<String>,
        action: impl Into<String>,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            action: action.into(),
            order_type: "Limit".to_string(),
            quantity,
            limit_price: Some(limit_price),
            stop_price: None,
            time_in_force: "DAY".to_string(),
        }
    }
}

/// A message sent to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request market data for a symbol.
    Subscribe {
        /// Instrument symbol.
        symbol: String,
        /// Subscription kind (`quote`, `trade`, `depth`, `chart`).
        #[serde(rename = "subscriptionType")]
        subscription_type: String,
    },

    /// Drop market data for a symbol.
    Unsubscribe {
        /// Instrument symbol.
        symbol: String,
        /// Subscription kind.
        #[serde(rename = "subscriptionType")]
        subscription_type: String,
    },

    /// Submit an order.
    Order {
        /// Order payload.
        #[serde(rename = "orderData")]
        order_data: OrderRequest,
    },

    /// Cancel a working order.
    CancelOrder {
        /// Gateway order id.
        #[serde(rename = "orderId")]
        order_id: String,
    },

    /// Request a fresh positions snapshot.
    GetPositions,

    /// Application-level ping.
    Ping,

    /// Application-level pong (reply to a server ping).
    Pong,

    /// Echo reply to a server `connection_test`.
    ConnectionTestResponse,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_connection_state() {
        let msg: GatewayMessage = serde_json::from_str(
            r#"{"type": "connection_state", "state": "authenticated", "message": "ok"}"#,
        )
        .unwrap();
        match msg {
            GatewayMessage::ConnectionState { state, error, .. } => {
                assert_eq!(state, "authenticated");
                assert!(error.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_validation_progress() {
        let msg: GatewayMessage = serde_json::from_str(
            r#"{"type": "validation_progress", "status": "checking_subscription"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            GatewayMessage::ValidationProgress { ref status, .. } if status == "checking_subscription"
        ));
    }

    #[test]
    fn decode_session_info() {
        let msg: GatewayMessage =
            serde_json::from_str(r#"{"type": "session_info", "session_id": "abc-123"}"#).unwrap();
        assert!(matches!(
            msg,
            GatewayMessage::SessionInfo { ref session_id } if session_id == "abc-123"
        ));
    }

    #[test]
    fn decode_user_data() {
        let msg: GatewayMessage = serde_json::from_str(
            r#"{"type": "user_data", "data": {
                "accounts": [{"name": "Main", "balance": 1000}],
                "positions": [{"id": 55, "netPos": 2, "netPrice": 100}],
                "orders": []
            }}"#,
        )
        .unwrap();
        match msg {
            GatewayMessage::UserData { data } => {
                assert_eq!(data.accounts.len(), 1);
                assert_eq!(data.positions.len(), 1);
                assert!(data.orders.is_empty());
                assert!(data.contracts.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn decode_positions_snapshot() {
        let msg: GatewayMessage = serde_json::from_str(
            r#"{"type": "positions_snapshot", "data": [
                {"positionId": "55", "netPos": 2},
                {"positionId": "56", "netPos": -1}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            GatewayMessage::PositionsSnapshot { ref data } if data.len() == 2
        ));
    }

    #[test]
    fn legacy_position_update_tag_maps_to_updated() {
        let msg: GatewayMessage = serde_json::from_str(
            r#"{"type": "position_update", "data": {"positionId": "55", "netPos": 3}}"#,
        )
        .unwrap();
        assert!(matches!(msg, GatewayMessage::PositionUpdated { .. }));
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let msg: GatewayMessage =
            serde_json::from_str(r#"{"type": "totally_new_thing", "data": {}}"#).unwrap();
        assert!(matches!(msg, GatewayMessage::Unknown));
    }

    #[test]
    fn encode_subscribe_uses_camel_case_field() {
        let msg = ClientMessage::Subscribe {
            symbol: "NQH6".to_string(),
            subscription_type: "quote".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"subscribe""#));
        assert!(json.contains(r#""subscriptionType":"quote""#));
    }

    #[test]
    fn encode_cancel_order() {
        let msg = ClientMessage::CancelOrder {
            order_id: "9001".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"cancel_order""#));
        assert!(json.contains(r#""orderId":"9001""#));
    }

    #[test]
    fn encode_order_request() {
        let msg = ClientMessage::Order {
            order_data: OrderRequest::limit("NQH6", "Buy", Decimal::new(2, 0), Decimal::new(100, 0)),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"order""#));
        assert!(json.contains(r#""orderData""#));
        assert!(json.contains(r#""orderType":"Limit""#));
        assert!(json.contains(r#""limitPrice""#));
        // Stop price omitted entirely for a plain limit order.
        assert!(!json.contains("stopPrice"));
    }

    #[test]
    fn encode_control_replies() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::ConnectionTestResponse).unwrap(),
            r#"{"type":"connection_test_response"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::GetPositions).unwrap(),
            r#"{"type":"get_positions"}"#
        );
    }

    #[test]
    fn market_order_request_defaults() {
        let request = OrderRequest::market("ESH6", "Sell", Decimal::new(1, 0));
        assert_eq!(request.order_type, "Market");
        assert_eq!(request.time_in_force, "DAY");
        assert!(request.limit_price.is_none());
        assert!(!request.client_order_id.is_empty());
    }
}
