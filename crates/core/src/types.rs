//! Domain types shared across the arbitrage engine.
//!
//! All prices and quantities are `rust_decimal::Decimal`; floating point is
//! never used for money. Order books keep their levels in `BTreeMap`s so the
//! best bid and ask are always the first entry on each side.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tolerance for the balance consistency invariant, in quote units.
pub const BALANCE_EPSILON: Decimal = dec!(0.0000001);

/// Depth retained per book side after applying a batch of updates.
pub const MAX_BOOK_DEPTH: usize = 100;

// =============================================================================
// Trading Pair
// =============================================================================

/// A base/quote currency pair, e.g. BTC/USDT.
///
/// Currency codes are normalized to uppercase on construction, so equality
/// and hashing are effectively case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    base: String,
    quote: String,
}

impl TradingPair {
    /// Creates a pair, uppercasing both currency codes.
    #[must_use]
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().to_uppercase(),
            quote: quote.as_ref().to_uppercase(),
        }
    }

    /// Base currency code (the asset being bought or sold).
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Quote currency code (the asset prices are denominated in).
    #[must_use]
    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for TradingPair {
    type Err = String;

    /// Parses `BTC/USDT` or `BTC-USDT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .or_else(|| s.split_once('-'))
            .ok_or_else(|| format!("invalid trading pair: {s}"))?;
        if base.is_empty() || quote.is_empty() {
            return Err(format!("invalid trading pair: {s}"));
        }
        Ok(Self::new(base, quote))
    }
}

// =============================================================================
// Sides and Order Types
// =============================================================================

/// Side of an order or book update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Buying the base currency (bids).
    Buy,
    /// Selling the base currency (asks).
    Sell,
}

impl Side {
    /// Returns the opposing side.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Execute immediately at the best available price.
    Market,
    /// Rest at (or cross from) a specified price.
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted, no fills yet.
    New,
    /// Some quantity filled, order still live.
    PartiallyFilled,
    /// Fully filled.
    Filled,
    /// Canceled by the caller or the exchange.
    Canceled,
    /// Rejected before entering the book.
    Rejected,
    /// Expired per its time-in-force.
    Expired,
}

impl OrderStatus {
    /// Returns true if the order can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

// =============================================================================
// Order Book
// =============================================================================

/// A single price level of resting liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    /// Level price, strictly positive.
    pub price: Decimal,
    /// Resting quantity at the price, strictly positive.
    pub quantity: Decimal,
}

impl OrderBookLevel {
    /// Creates a level.
    #[must_use]
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// An L2 order book for one pair on one exchange.
///
/// Bids iterate in descending price order, asks ascending, so the first
/// entry of each side is the top of book. Zero-size updates remove a level.
#[derive(Debug, Clone)]
pub struct OrderBook {
    /// Exchange this book belongs to.
    pub exchange_id: String,
    /// Pair this book is for.
    pub pair: TradingPair,
    /// Time of the last applied update.
    pub timestamp: DateTime<Utc>,
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new(exchange_id: impl Into<String>, pair: TradingPair) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            pair,
            timestamp: Utc::now(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    /// Best (highest) bid, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.bids
            .iter()
            .next()
            .map(|(p, q)| OrderBookLevel::new(p.0, *q))
    }

    /// Best (lowest) ask, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.asks
            .iter()
            .next()
            .map(|(p, q)| OrderBookLevel::new(*p, *q))
    }

    /// Bid levels, best first.
    pub fn bids(&self) -> impl Iterator<Item = OrderBookLevel> + '_ {
        self.bids
            .iter()
            .map(|(p, q)| OrderBookLevel::new(p.0, *q))
    }

    /// Ask levels, best first.
    pub fn asks(&self) -> impl Iterator<Item = OrderBookLevel> + '_ {
        self.asks.iter().map(|(p, q)| OrderBookLevel::new(*p, *q))
    }

    /// Number of bid levels.
    #[must_use]
    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    /// Number of ask levels.
    #[must_use]
    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Returns true when both sides have at least one level.
    #[must_use]
    pub fn has_both_sides(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Returns true when the best bid meets or crosses the best ask.
    ///
    /// A crossed book is an invariant violation; callers are expected to
    /// discard the book and resync.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Replaces both sides from snapshot levels, dropping non-positive sizes.
    pub fn apply_snapshot(
        &mut self,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        timestamp: DateTime<Utc>,
    ) {
        self.bids.clear();
        self.asks.clear();
        for (price, qty) in bids {
            if price > Decimal::ZERO && qty > Decimal::ZERO {
                self.bids.insert(Reverse(price), qty);
            }
        }
        for (price, qty) in asks {
            if price > Decimal::ZERO && qty > Decimal::ZERO {
                self.asks.insert(price, qty);
            }
        }
        self.truncate_depth(MAX_BOOK_DEPTH);
        self.timestamp = timestamp;
    }

    /// Applies one delta: size replaces the level, zero (or negative) removes it.
    pub fn apply_delta(
        &mut self,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        timestamp: DateTime<Utc>,
    ) {
        match side {
            Side::Buy => {
                if quantity > Decimal::ZERO {
                    self.bids.insert(Reverse(price), quantity);
                } else {
                    self.bids.remove(&Reverse(price));
                }
            }
            Side::Sell => {
                if quantity > Decimal::ZERO {
                    self.asks.insert(price, quantity);
                } else {
                    self.asks.remove(&price);
                }
            }
        }
        self.timestamp = timestamp;
    }

    /// Drops levels beyond `depth` on each side, keeping the best.
    pub fn truncate_depth(&mut self, depth: usize) {
        while self.bids.len() > depth {
            let last = self.bids.keys().next_back().copied();
            if let Some(key) = last {
                self.bids.remove(&key);
            }
        }
        while self.asks.len() > depth {
            let last = self.asks.keys().next_back().copied();
            if let Some(key) = last {
                self.asks.remove(&key);
            }
        }
    }

    /// Clears both sides, e.g. ahead of a resync.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Age of this book relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }

    /// Projects the top of book into a quote.
    ///
    /// Returns `None` unless both sides are non-empty with positive prices
    /// and quantities.
    #[must_use]
    pub fn quote(&self) -> Option<PriceQuote> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        if bid.price <= Decimal::ZERO || ask.price <= Decimal::ZERO {
            return None;
        }
        if bid.quantity <= Decimal::ZERO || ask.quantity <= Decimal::ZERO {
            return None;
        }
        Some(PriceQuote {
            exchange_id: self.exchange_id.clone(),
            pair: self.pair.clone(),
            timestamp: self.timestamp,
            best_bid_price: bid.price,
            best_bid_qty: bid.quantity,
            best_ask_price: ask.price,
            best_ask_qty: ask.quantity,
        })
    }
}

/// Top-of-book projection of an [`OrderBook`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Exchange the quote came from.
    pub exchange_id: String,
    /// Pair quoted.
    pub pair: TradingPair,
    /// Book timestamp at projection time.
    pub timestamp: DateTime<Utc>,
    /// Best bid price.
    pub best_bid_price: Decimal,
    /// Quantity at the best bid.
    pub best_bid_qty: Decimal,
    /// Best ask price.
    pub best_ask_price: Decimal,
    /// Quantity at the best ask.
    pub best_ask_qty: Decimal,
}

// =============================================================================
// Orders and Executions
// =============================================================================

/// An order as known to the engine, live or terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned order ID.
    pub id: String,
    /// Exchange the order was placed on.
    pub exchange_id: String,
    /// Pair traded.
    pub pair: TradingPair,
    /// Buy or sell.
    pub side: Side,
    /// Market or limit.
    pub order_type: OrderType,
    /// Current lifecycle status.
    pub status: OrderStatus,
    /// Limit price; `None` for market orders.
    pub price: Option<Decimal>,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Quantity filled so far.
    pub filled_quantity: Decimal,
    /// Volume-weighted average fill price, if any quantity filled.
    pub avg_fill_price: Option<Decimal>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub last_updated: DateTime<Utc>,
}

impl Order {
    /// Remaining unfilled quantity.
    #[must_use]
    pub fn remaining_quantity(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    /// Returns true if the full requested quantity filled.
    #[must_use]
    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_quantity >= self.quantity
    }

    /// Notional value of the filled quantity, if a fill price is known.
    #[must_use]
    pub fn fill_notional(&self) -> Option<Decimal> {
        self.avg_fill_price.map(|p| p * self.filled_quantity)
    }
}

/// An atomic fill record for one leg of a trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeExecution {
    /// ID of this execution record.
    pub trade_id: Uuid,
    /// Exchange the fill occurred on.
    pub exchange_id: String,
    /// Pair traded.
    pub pair: TradingPair,
    /// Buy or sell.
    pub side: Side,
    /// Order type used.
    pub order_type: OrderType,
    /// Average fill price.
    pub price: Decimal,
    /// Filled quantity.
    pub quantity: Decimal,
    /// Fee charged.
    pub fee: Decimal,
    /// Currency the fee was charged in.
    pub fee_currency: String,
    /// Fill time.
    pub timestamp: DateTime<Utc>,
    /// Opportunity this execution belongs to, if any.
    pub opportunity_id: Option<Uuid>,
}

impl TradeExecution {
    /// Notional value (price × quantity).
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Outcome of one paired execution attempt.
///
/// Exactly one `TradeResult` is produced per attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    /// ID of this result.
    pub id: Uuid,
    /// Opportunity that was executed.
    pub opportunity_id: Uuid,
    /// True iff both legs reached a reconciled filled state.
    pub is_success: bool,
    /// Buy leg fill, if it happened.
    pub buy_execution: Option<TradeExecution>,
    /// Sell leg fill, if it happened.
    pub sell_execution: Option<TradeExecution>,
    /// Realized profit in quote currency (negative on losing unwinds).
    pub profit: Decimal,
    /// Profit as a percentage of buy notional.
    pub profit_pct: Decimal,
    /// Failure description when `is_success` is false.
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Balances and Fees
// =============================================================================

/// A currency balance on one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Exchange holding the balance.
    pub exchange_id: String,
    /// Currency code.
    pub currency: String,
    /// Total amount held.
    pub total: Decimal,
    /// Amount free to trade.
    pub available: Decimal,
    /// Amount locked in open orders or reservations.
    pub reserved: Decimal,
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
}

impl Balance {
    /// Creates a balance from total and available; reserved is derived.
    #[must_use]
    pub fn new(
        exchange_id: impl Into<String>,
        currency: impl AsRef<str>,
        total: Decimal,
        available: Decimal,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            currency: currency.as_ref().to_uppercase(),
            total,
            available,
            reserved: (total - available).max(Decimal::ZERO),
            timestamp: Utc::now(),
        }
    }

    /// Checks `total ≈ available + reserved` within [`BALANCE_EPSILON`],
    /// with all three components non-negative.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total >= Decimal::ZERO
            && self.available >= Decimal::ZERO
            && self.reserved >= Decimal::ZERO
            && (self.total - (self.available + self.reserved)).abs() <= BALANCE_EPSILON
    }
}

/// Fee rates for one exchange, as fractions in `[0, 1)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Exchange the schedule applies to.
    pub exchange_id: String,
    /// Fee when adding liquidity.
    pub maker_rate: Decimal,
    /// Fee when taking liquidity.
    pub taker_rate: Decimal,
    /// Withdrawal fee, where published.
    pub withdrawal_rate: Option<Decimal>,
}

impl FeeSchedule {
    /// Creates a schedule with maker and taker rates.
    #[must_use]
    pub fn new(exchange_id: impl Into<String>, maker_rate: Decimal, taker_rate: Decimal) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            maker_rate,
            taker_rate,
            withdrawal_rate: None,
        }
    }

    /// Taker fee charged on the given notional.
    #[must_use]
    pub fn taker_fee(&self, notional: Decimal) -> Decimal {
        notional * self.taker_rate
    }
}

// =============================================================================
// Tests
// =============================================================================
