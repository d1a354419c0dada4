//! Wire types for the Kraken WebSocket feed and REST API.
//!
//! The WebSocket book channel delivers JSON arrays rather than tagged
//! objects, so book payloads are decoded through `serde_json::Value` into
//! typed messages. REST responses share the `{error: [], result: {}}`
//! envelope; error strings are classified into the engine taxonomy here.

use crate::symbols::parse_ws_pair;
use chrono::{DateTime, TimeZone, Utc};
use cross_arb_core::{
    ExchangeError, Order, OrderStatus, OrderType, Result, Side, TradingPair,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Parses a wire decimal string.
///
/// # Errors
/// Returns `Protocol` on malformed input.
pub fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|_| ExchangeError::protocol(format!("bad decimal: {s}")))
}

fn parse_wire_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let seconds: f64 = s
        .parse()
        .map_err(|_| ExchangeError::protocol(format!("bad timestamp: {s}")))?;
    Ok(Utc.timestamp_nanos((seconds * 1e9) as i64))
}

// =============================================================================
// WebSocket Messages
// =============================================================================

/// Outbound subscribe/unsubscribe for the book channel.
#[derive(Debug, Serialize)]
pub struct BookSubscription {
    event: &'static str,
    pair: Vec<String>,
    subscription: SubscriptionSpec,
}

#[derive(Debug, Serialize)]
struct SubscriptionSpec {
    name: &'static str,
    depth: usize,
}

impl BookSubscription {
    /// Subscribe to the depth-100 book for the given wire pair names.
    #[must_use]
    pub fn subscribe(pairs: Vec<String>, depth: usize) -> Self {
        Self {
            event: "subscribe",
            pair: pairs,
            subscription: SubscriptionSpec { name: "book", depth },
        }
    }

    /// Unsubscribe from the book channel.
    #[must_use]
    pub fn unsubscribe(pairs: Vec<String>, depth: usize) -> Self {
        Self {
            event: "unsubscribe",
            pair: pairs,
            subscription: SubscriptionSpec { name: "book", depth },
        }
    }

    /// Serializes to the wire string.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("static message shape")
    }
}

/// One `[price, volume, timestamp]` book entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    /// Level price.
    pub price: Decimal,
    /// Level volume; zero removes the level.
    pub volume: Decimal,
    /// Exchange timestamp of the entry.
    pub timestamp: DateTime<Utc>,
}

/// A decoded book channel message.
#[derive(Debug, Clone)]
pub struct BookMessage {
    /// Canonical pair.
    pub pair: TradingPair,
    /// True for the initial `as`/`bs` snapshot, false for `a`/`b` deltas.
    pub is_snapshot: bool,
    /// Bid entries.
    pub bids: Vec<BookEntry>,
    /// Ask entries.
    pub asks: Vec<BookEntry>,
}

/// A decoded WebSocket message.
#[derive(Debug, Clone)]
pub enum KrakenWsMessage {
    /// Keepalive.
    Heartbeat,
    /// Subscription acknowledgement or failure.
    SubscriptionStatus {
        /// `subscribed`, `unsubscribed`, or `error`.
        status: String,
        /// Error detail when `status == "error"`.
        error_message: Option<String>,
    },
    /// Exchange status broadcast.
    SystemStatus,
    /// Book snapshot or delta.
    Book(BookMessage),
    /// Anything else; logged and dropped by the caller.
    Unknown(String),
}

/// Parses one WebSocket frame.
///
/// # Errors
/// Returns `Protocol` when the frame is neither a known event object nor a
/// well-formed book array.
pub fn parse_ws_message(text: &str) -> Result<KrakenWsMessage> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if let Some(object) = value.as_object() {
        let event = object.get("event").and_then(|v| v.as_str()).unwrap_or("");
        return Ok(match event {
            "heartbeat" => KrakenWsMessage::Heartbeat,
            "systemStatus" => KrakenWsMessage::SystemStatus,
            "subscriptionStatus" => KrakenWsMessage::SubscriptionStatus {
                status: object
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                error_message: object
                    .get("errorMessage")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            },
            other => KrakenWsMessage::Unknown(other.to_string()),
        });
    }

    let array = value
        .as_array()
        .ok_or_else(|| ExchangeError::protocol("frame is neither object nor array"))?;
    if array.len() < 4 {
        return Err(ExchangeError::protocol("book frame too short"));
    }

    let pair_name = array[array.len() - 1]
        .as_str()
        .ok_or_else(|| ExchangeError::protocol("book frame missing pair"))?;
    let pair = parse_ws_pair(pair_name)?;

    let mut is_snapshot = false;
    let mut bids = Vec::new();
    let mut asks = Vec::new();

    // Payload objects sit between the channel id and the trailing
    // channel-name/pair strings; updates may split a/b across two objects.
    for payload in &array[1..array.len() - 2] {
        let Some(object) = payload.as_object() else {
            continue;
        };
        for (key, levels) in object {
            let target = match key.as_str() {
                "bs" => {
                    is_snapshot = true;
                    &mut bids
                }
                "as" => {
                    is_snapshot = true;
                    &mut asks
                }
                "b" => &mut bids,
                "a" => &mut asks,
                "c" => continue, // checksum
                _ => continue,
            };
            let levels = levels
                .as_array()
                .ok_or_else(|| ExchangeError::protocol("levels is not an array"))?;
            for level in levels {
                target.push(parse_book_entry(level)?);
            }
        }
    }

    Ok(KrakenWsMessage::Book(BookMessage {
        pair,
        is_snapshot,
        bids,
        asks,
    }))
}

fn parse_book_entry(level: &serde_json::Value) -> Result<BookEntry> {
    let entry = level
        .as_array()
        .ok_or_else(|| ExchangeError::protocol("level is not an array"))?;
    if entry.len() < 3 {
        return Err(ExchangeError::protocol("level too short"));
    }
    let price = entry[0]
        .as_str()
        .ok_or_else(|| ExchangeError::protocol("level price is not a string"))?;
    let volume = entry[1]
        .as_str()
        .ok_or_else(|| ExchangeError::protocol("level volume is not a string"))?;
    let timestamp = entry[2]
        .as_str()
        .ok_or_else(|| ExchangeError::protocol("level timestamp is not a string"))?;

    Ok(BookEntry {
        price: parse_decimal(price)?,
        volume: parse_decimal(volume)?,
        timestamp: parse_wire_timestamp(timestamp)?,
    })
}

// =============================================================================
// REST Envelope
// =============================================================================

/// The `{error: [], result: {}}` envelope every REST endpoint uses.
#[derive(Debug, Deserialize)]
pub struct RestResponse<T> {
    /// Error strings; empty on success.
    #[serde(default)]
    pub error: Vec<String>,
    /// Payload, present on success.
    pub result: Option<T>,
}

impl<T> RestResponse<T> {
    /// Unwraps the payload, classifying Kraken error strings.
    ///
    /// # Errors
    /// Returns the mapped `ExchangeError` for the first error string.
    pub fn into_result(self) -> Result<T> {
        if let Some(first) = self.error.first() {
            return Err(classify_error(first));
        }
        self.result
            .ok_or_else(|| ExchangeError::protocol("response missing result"))
    }
}

fn classify_error(error: &str) -> ExchangeError {
    if error.starts_with("EAPI:Rate limit") || error.contains("Too many requests") {
        ExchangeError::RateLimit {
            retry_after_secs: 1,
        }
    } else if error.starts_with("EAPI:") || error.contains("Invalid signature") {
        ExchangeError::Auth(error.to_string())
    } else if error.contains("Insufficient funds") {
        ExchangeError::insufficient_balance("", "", "")
    } else if error.starts_with("EQuery:Unknown order") {
        ExchangeError::OrderNotFound {
            order_id: String::new(),
        }
    } else if error.starts_with("EOrder:") {
        ExchangeError::OrderRejected(error.to_string())
    } else if error.starts_with("EService:") {
        ExchangeError::transport(error.to_string())
    } else {
        ExchangeError::protocol(error.to_string())
    }
}

// =============================================================================
// REST Payloads
// =============================================================================

/// One side of a `Depth` response: `[price, volume, timestamp]`.
pub type DepthLevel = (String, String, serde_json::Value);

/// `Depth` result entry.
#[derive(Debug, Deserialize)]
pub struct DepthEntry {
    /// Ask levels, best first.
    pub asks: Vec<DepthLevel>,
    /// Bid levels, best first.
    pub bids: Vec<DepthLevel>,
}

impl DepthEntry {
    /// Parses both sides into decimal levels.
    ///
    /// # Errors
    /// Returns `Protocol` on a malformed level.
    pub fn levels(&self) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>)> {
        let parse = |levels: &[DepthLevel]| {
            levels
                .iter()
                .map(|(p, v, _)| Ok((parse_decimal(p)?, parse_decimal(v)?)))
                .collect::<Result<Vec<_>>>()
        };
        Ok((parse(&self.bids)?, parse(&self.asks)?))
    }
}

/// `BalanceEx` result entry.
#[derive(Debug, Deserialize)]
pub struct BalanceExEntry {
    /// Total balance.
    pub balance: String,
    /// Amount held by open orders.
    #[serde(default)]
    pub hold_trade: Option<String>,
}

/// `TradeVolume` fee entry.
#[derive(Debug, Deserialize)]
pub struct FeeInfo {
    /// Fee percent for the current volume tier.
    pub fee: String,
}

/// `TradeVolume` result.
#[derive(Debug, Deserialize)]
pub struct TradeVolumeResult {
    /// Taker fee tiers by pair.
    #[serde(default)]
    pub fees: Option<HashMap<String, FeeInfo>>,
    /// Maker fee tiers by pair.
    #[serde(default)]
    pub fees_maker: Option<HashMap<String, FeeInfo>>,
}

/// `AddOrder` result.
#[derive(Debug, Deserialize)]
pub struct AddOrderResult {
    /// Transaction ids of the created order.
    pub txid: Vec<String>,
}

/// `CancelOrder` result.
#[derive(Debug, Deserialize)]
pub struct CancelOrderResult {
    /// Number of canceled orders.
    pub count: u32,
}

/// Order description inside `QueryOrders`.
#[derive(Debug, Deserialize)]
pub struct OrderDescription {
    /// `buy` or `sell`.
    #[serde(rename = "type")]
    pub side: String,
    /// `market` or `limit`.
    pub ordertype: String,
    /// Limit price; `0` for market orders.
    #[serde(default)]
    pub price: Option<String>,
}

/// One order from `QueryOrders`.
#[derive(Debug, Deserialize)]
pub struct OrderInfo {
    /// `pending`, `open`, `closed`, `canceled`, `expired`.
    pub status: String,
    /// Requested volume.
    pub vol: String,
    /// Executed volume.
    pub vol_exec: String,
    /// Average execution price.
    #[serde(default)]
    pub price: Option<String>,
    /// Order description.
    pub descr: OrderDescription,
    /// Open time, seconds since epoch.
    #[serde(default)]
    pub opentm: Option<f64>,
}

impl OrderInfo {
    /// Converts to the canonical order type.
    ///
    /// # Errors
    /// Returns `Protocol` on unknown side, type, status, or bad decimals.
    pub fn to_order(
        &self,
        exchange_id: &str,
        order_id: &str,
        pair: &TradingPair,
    ) -> Result<Order> {
        let side = match self.descr.side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            other => return Err(ExchangeError::protocol(format!("bad side: {other}"))),
        };
        let order_type = match self.descr.ordertype.as_str() {
            "market" => OrderType::Market,
            "limit" => OrderType::Limit,
            other => return Err(ExchangeError::protocol(format!("bad order type: {other}"))),
        };

        let quantity = parse_decimal(&self.vol)?;
        let filled_quantity = parse_decimal(&self.vol_exec)?;

        let status = match self.status.as_str() {
            "pending" | "open" => {
                if filled_quantity > Decimal::ZERO {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::New
                }
            }
            "closed" => OrderStatus::Filled,
            "canceled" => OrderStatus::Canceled,
            "expired" => OrderStatus::Expired,
            other => {
                return Err(ExchangeError::protocol(format!("bad status: {other}")));
            }
        };

        let avg_fill_price = match &self.price {
            Some(p) if filled_quantity > Decimal::ZERO => {
                let price = parse_decimal(p)?;
                (price > Decimal::ZERO).then_some(price)
            }
            _ => None,
        };

        let limit_price = match &self.descr.price {
            Some(p) if order_type == OrderType::Limit => Some(parse_decimal(p)?),
            _ => None,
        };

        let created_at = self
            .opentm
            .map(|secs| Utc.timestamp_nanos((secs * 1e9) as i64))
            .unwrap_or_else(Utc::now);

        Ok(Order {
            id: order_id.to_string(),
            exchange_id: exchange_id.to_string(),
            pair: pair.clone(),
            side,
            order_type,
            status,
            price: limit_price,
            quantity,
            filled_quantity,
            avg_fill_price,
            created_at,
            last_updated: Utc::now(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
