//! Wire types for the Coinbase WebSocket feed and REST API.
//!
//! All decimals on the wire arrive as strings and are parsed with arbitrary
//! precision. Malformed values surface as `Protocol` errors so the caller
//! can drop the message and keep the stream alive.

use chrono::{DateTime, Utc};
use cross_arb_core::{
    ExchangeError, Order, OrderStatus, OrderType, Result, Side, TradingPair,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Formats a pair as a Coinbase product id, e.g. `BTC-USDT`.
#[must_use]
pub fn product_id(pair: &TradingPair) -> String {
    format!("{}-{}", pair.base(), pair.quote())
}

/// Parses a Coinbase product id back into a pair.
///
/// # Errors
/// Returns `Protocol` when the id is not `BASE-QUOTE`.
pub fn parse_product_id(id: &str) -> Result<TradingPair> {
    id.parse::<TradingPair>()
        .map_err(|_| ExchangeError::protocol(format!("bad product id: {id}")))
}

/// Parses a wire decimal string.
///
/// # Errors
/// Returns `Protocol` on malformed input.
pub fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|_| ExchangeError::protocol(format!("bad decimal: {s}")))
}

// =============================================================================
// WebSocket Messages
// =============================================================================

/// Outbound subscribe/unsubscribe message for the `level2` channel.
#[derive(Debug, Serialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    msg_type: &'static str,
    product_ids: Vec<String>,
    channels: [&'static str; 1],
}

impl ChannelMessage {
    /// Subscribe to level2 books for the given pairs.
    #[must_use]
    pub fn subscribe(pairs: &[&TradingPair]) -> Self {
        Self {
            msg_type: "subscribe",
            product_ids: pairs.iter().map(|p| product_id(p)).collect(),
            channels: ["level2"],
        }
    }

    /// Unsubscribe from level2 books for the given pairs.
    #[must_use]
    pub fn unsubscribe(pairs: &[&TradingPair]) -> Self {
        Self {
            msg_type: "unsubscribe",
            product_ids: pairs.iter().map(|p| product_id(p)).collect(),
            channels: ["level2"],
        }
    }

    /// Serializes to the wire string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("static message shape")
    }
}

/// Inbound message envelope; the payload shape depends on `type`.
#[derive(Debug, Deserialize)]
pub struct WsEnvelope {
    /// Message kind discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining payload, decoded per kind.
    #[serde(flatten)]
    pub data: serde_json::Value,
}

/// Full book snapshot, sent once after subscribing.
#[derive(Debug, Deserialize)]
pub struct SnapshotMessage {
    /// Product the snapshot is for.
    pub product_id: String,
    /// `[price, size]` bid levels.
    pub bids: Vec<(String, String)>,
    /// `[price, size]` ask levels.
    pub asks: Vec<(String, String)>,
}

impl SnapshotMessage {
    /// Parses bid levels into decimals.
    ///
    /// # Errors
    /// Returns `Protocol` on a malformed level.
    pub fn bid_levels(&self) -> Result<Vec<(Decimal, Decimal)>> {
        parse_levels(&self.bids)
    }

    /// Parses ask levels into decimals.
    ///
    /// # Errors
    /// Returns `Protocol` on a malformed level.
    pub fn ask_levels(&self) -> Result<Vec<(Decimal, Decimal)>> {
        parse_levels(&self.asks)
    }
}

fn parse_levels(levels: &[(String, String)]) -> Result<Vec<(Decimal, Decimal)>> {
    levels
        .iter()
        .map(|(price, size)| Ok((parse_decimal(price)?, parse_decimal(size)?)))
        .collect()
}

/// Incremental book update.
#[derive(Debug, Deserialize)]
pub struct L2UpdateMessage {
    /// Product the update is for.
    pub product_id: String,
    /// `[side, price, size]` changes; size `0` removes the level.
    pub changes: Vec<(String, String, String)>,
    /// Exchange timestamp of the update.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl L2UpdateMessage {
    /// Parses changes into typed deltas.
    ///
    /// # Errors
    /// Returns `Protocol` on a malformed side or decimal.
    pub fn deltas(&self) -> Result<Vec<(Side, Decimal, Decimal)>> {
        self.changes
            .iter()
            .map(|(side, price, size)| {
                let side = match side.as_str() {
                    "buy" => Side::Buy,
                    "sell" => Side::Sell,
                    other => {
                        return Err(ExchangeError::protocol(format!("bad side: {other}")));
                    }
                };
                Ok((side, parse_decimal(price)?, parse_decimal(size)?))
            })
            .collect()
    }
}

// =============================================================================
// REST Responses
// =============================================================================

/// Level2 book from `GET /products/{id}/book?level=2`.
#[derive(Debug, Deserialize)]
pub struct RestBookResponse {
    /// Book sequence number.
    #[serde(default)]
    pub sequence: Option<u64>,
    /// `[price, size, num_orders]` bid levels.
    pub bids: Vec<(String, String, serde_json::Value)>,
    /// `[price, size, num_orders]` ask levels.
    pub asks: Vec<(String, String, serde_json::Value)>,
}

impl RestBookResponse {
    /// Parses both sides into decimal levels.
    ///
    /// # Errors
    /// Returns `Protocol` on a malformed level.
    pub fn levels(&self) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>)> {
        let bids = self
            .bids
            .iter()
            .map(|(p, s, _)| Ok((parse_decimal(p)?, parse_decimal(s)?)))
            .collect::<Result<Vec<_>>>()?;
        let asks = self
            .asks
            .iter()
            .map(|(p, s, _)| Ok((parse_decimal(p)?, parse_decimal(s)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok((bids, asks))
    }
}

/// One account from `GET /accounts`.
#[derive(Debug, Deserialize)]
pub struct AccountResponse {
    /// Account id.
    pub id: String,
    /// Currency code.
    pub currency: String,
    /// Total balance.
    pub balance: String,
    /// Available to trade.
    pub available: String,
    /// Held in open orders.
    pub hold: String,
}

/// Fee rates from `GET /fees`.
#[derive(Debug, Deserialize)]
pub struct FeesResponse {
    /// Maker rate as a fraction.
    pub maker_fee_rate: String,
    /// Taker rate as a fraction.
    pub taker_fee_rate: String,
}

/// Order placement payload for `POST /orders`.
#[derive(Debug, Serialize)]
pub struct PlaceOrderRequest {
    /// Product to trade.
    pub product_id: String,
    /// `buy` or `sell`.
    pub side: String,
    /// `market` or `limit`.
    #[serde(rename = "type")]
    pub order_type: String,
    /// Base quantity.
    pub size: String,
    /// Limit price; omitted for market orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
}

/// Order state from `POST /orders`, `GET /orders/{id}`, `DELETE /orders/{id}`.
#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    /// Exchange order id.
    pub id: String,
    /// Product traded.
    pub product_id: String,
    /// `buy` or `sell`.
    pub side: String,
    /// `market` or `limit`.
    #[serde(rename = "type")]
    pub order_type: String,
    /// `pending`, `open`, `active`, `done`, `rejected`.
    pub status: String,
    /// Reason the order finished, when `status == done`.
    #[serde(default)]
    pub done_reason: Option<String>,
    /// Limit price, if any.
    #[serde(default)]
    pub price: Option<String>,
    /// Requested size.
    pub size: String,
    /// Filled size.
    #[serde(default)]
    pub filled_size: Option<String>,
    /// Quote value of fills.
    #[serde(default)]
    pub executed_value: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl OrderResponse {
    /// Converts to the canonical order type.
    ///
    /// # Errors
    /// Returns `Protocol` on unknown side, type, status, or bad decimals.
    pub fn to_order(&self, exchange_id: &str) -> Result<Order> {
        let pair = parse_product_id(&self.product_id)?;
        let side = match self.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => return Err(ExchangeError::protocol(format!("bad side: {other}"))),
        };
        let order_type = match self.order_type.as_str() {
            "market" => OrderType::Market,
            "limit" => OrderType::Limit,
            other => return Err(ExchangeError::protocol(format!("bad order type: {other}"))),
        };

        let quantity = parse_decimal(&self.size)?;
        let filled_quantity = match &self.filled_size {
            Some(s) => parse_decimal(s)?,
            None => Decimal::ZERO,
        };
        let executed_value = match &self.executed_value {
            Some(s) => parse_decimal(s)?,
            None => Decimal::ZERO,
        };

        let status = match (self.status.as_str(), self.done_reason.as_deref()) {
            ("pending" | "received" | "open" | "active", _) => {
                if filled_quantity > Decimal::ZERO {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::New
                }
            }
            ("done", Some("filled")) => OrderStatus::Filled,
            ("done", Some("canceled")) => OrderStatus::Canceled,
            ("done", _) => {
                if filled_quantity >= quantity && quantity > Decimal::ZERO {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Canceled
                }
            }
            ("rejected", _) => OrderStatus::Rejected,
            (other, _) => {
                return Err(ExchangeError::protocol(format!("bad status: {other}")));
            }
        };

        let avg_fill_price = if filled_quantity > Decimal::ZERO {
            Some(executed_value / filled_quantity)
        } else {
            None
        };

        Ok(Order {
            id: self.id.clone(),
            exchange_id: exchange_id.to_string(),
            pair,
            side,
            order_type,
            status,
            price: match &self.price {
                Some(p) => Some(parse_decimal(p)?),
                None => None,
            },
            quantity,
            filled_quantity,
            avg_fill_price,
            created_at: self.created_at,
            last_updated: Utc::now(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    #[test]
    fn test_product_id_round_trip() {
        assert_eq!(product_id(&pair()), "BTC-USDT");
        assert_eq!(parse_product_id("BTC-USDT").unwrap(), pair());
        assert!(parse_product_id("BTCUSDT").is_err());
    }

    #[test]
    fn test_subscribe_message_shape() {
        let p = pair();
        let json = ChannelMessage::subscribe(&[&p]).to_json();
        assert!(json.contains(r#""type":"subscribe""#));
        assert!(json.contains(r#""product_ids":["BTC-USDT"]"#));
        assert!(json.contains(r#""channels":["level2"]"#));

        let json = ChannelMessage::unsubscribe(&[&p]).to_json();
        assert!(json.contains(r#""type":"unsubscribe""#));
    }

    #[test]
    fn test_snapshot_parsing() {
        let json = r#"{
            "type": "snapshot",
            "product_id": "BTC-USDT",
            "bids": [["49990.00", "1.5"], ["49980.00", "2.0"]],
            "asks": [["50000.00", "0.5"]]
        }"#;
        let envelope: WsEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.kind, "snapshot");

        let msg: SnapshotMessage = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(msg.product_id, "BTC-USDT");
        let bids = msg.bid_levels().unwrap();
        assert_eq!(bids[0], (dec!(49990.00), dec!(1.5)));
        assert_eq!(msg.ask_levels().unwrap().len(), 1);
    }

    #[test]
    fn test_l2update_parsing() {
        let json = r#"{
            "type": "l2update",
            "product_id": "BTC-USDT",
            "changes": [["buy", "49995.00", "0.75"], ["sell", "50010.00", "0"]],
            "time": "2024-02-01T12:00:00.000000Z"
        }"#;
        let envelope: WsEnvelope = serde_json::from_str(json).unwrap();
        let msg: L2UpdateMessage = serde_json::from_value(envelope.data).unwrap();
        let deltas = msg.deltas().unwrap();
        assert_eq!(deltas[0], (Side::Buy, dec!(49995.00), dec!(0.75)));
        assert_eq!(deltas[1], (Side::Sell, dec!(50010.00), Decimal::ZERO));
        assert!(msg.time.is_some());
    }

    #[test]
    fn test_l2update_bad_side_is_protocol_error() {
        let msg = L2UpdateMessage {
            product_id: "BTC-USDT".to_string(),
            changes: vec![("hold".to_string(), "1".to_string(), "1".to_string())],
            time: None,
        };
        assert!(matches!(
            msg.deltas().unwrap_err(),
            ExchangeError::Protocol(_)
        ));
    }

    #[test]
    fn test_rest_book_levels() {
        let json = r#"{
            "sequence": 42,
            "bids": [["49990.00", "1.5", 3]],
            "asks": [["50000.00", "0.5", 1]]
        }"#;
        let book: RestBookResponse = serde_json::from_str(json).unwrap();
        let (bids, asks) = book.levels().unwrap();
        assert_eq!(bids, vec![(dec!(49990.00), dec!(1.5))]);
        assert_eq!(asks, vec![(dec!(50000.00), dec!(0.5))]);
        assert_eq!(book.sequence, Some(42));
    }

    #[test]
    fn test_order_response_filled() {
        let json = r#"{
            "id": "ord-1",
            "product_id": "BTC-USDT",
            "side": "buy",
            "type": "market",
            "status": "done",
            "done_reason": "filled",
            "size": "0.5",
            "filled_size": "0.5",
            "executed_value": "25000.00",
            "created_at": "2024-02-01T12:00:00Z"
        }"#;
        let response: OrderResponse = serde_json::from_str(json).unwrap();
        let order = response.to_order("coinbase").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(0.5));
        assert_eq!(order.avg_fill_price, Some(dec!(50000.00)));
        assert!(order.is_fully_filled());
    }

    #[test]
    fn test_order_response_partial_then_canceled() {
        let json = r#"{
            "id": "ord-2",
            "product_id": "BTC-USDT",
            "side": "sell",
            "type": "limit",
            "status": "done",
            "done_reason": "canceled",
            "price": "50100.00",
            "size": "1.0",
            "filled_size": "0.25",
            "executed_value": "12525.00",
            "created_at": "2024-02-01T12:00:00Z"
        }"#;
        let order: Order = serde_json::from_str::<OrderResponse>(json)
            .unwrap()
            .to_order("coinbase")
            .unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert_eq!(order.filled_quantity, dec!(0.25));
        assert_eq!(order.avg_fill_price, Some(dec!(50100.00)));
    }

    #[test]
    fn test_order_response_open_with_fills_is_partial() {
        let json = r#"{
            "id": "ord-3",
            "product_id": "ETH-USDT",
            "side": "buy",
            "type": "limit",
            "status": "open",
            "price": "3000.00",
            "size": "2.0",
            "filled_size": "0.5",
            "executed_value": "1500.00",
            "created_at": "2024-02-01T12:00:00Z"
        }"#;
        let order: Order = serde_json::from_str::<OrderResponse>(json)
            .unwrap()
            .to_order("coinbase")
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.remaining_quantity(), dec!(1.5));
    }
}
