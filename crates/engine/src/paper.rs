//! Paper trading venue.
//!
//! Implements the same [`ExecutionVenue`] surface as live execution but
//! never touches the network: fills come from the best opposing level the
//! aggregator currently holds, balances live in memory, and every simulated
//! fill is appended to an in-memory history queryable like the repository
//! surface.
//!
//! Marketable limits fill at the book price; a non-marketable limit sits
//! open with zero execution. Fees come from the configured schedules.

use crate::aggregator::MarketDataAggregator;
use crate::executor::ExecutionVenue;
use async_trait::async_trait;
use chrono::Utc;
use cross_arb_core::{
    Balance, ExchangeError, FeeSchedule, Order, OrderStatus, OrderType, Side, TradeExecution,
    TradingPair,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// One seeded balance.
#[derive(Debug, Clone)]
pub struct PaperBalance {
    /// Exchange holding the balance.
    pub exchange_id: String,
    /// Currency code.
    pub currency: String,
    /// Starting amount.
    pub amount: Decimal,
}

/// Configuration for the paper venue.
#[derive(Debug, Clone)]
pub struct PaperVenueConfig {
    /// Explicit starting balances.
    pub initial_balances: Vec<PaperBalance>,
    /// Fee schedules per exchange.
    pub fees: Vec<FeeSchedule>,
    /// Balance seeded for any (exchange, currency) not listed explicitly.
    pub fallback_balance: Decimal,
}

impl Default for PaperVenueConfig {
    fn default() -> Self {
        Self {
            initial_balances: Vec::new(),
            fees: Vec::new(),
            fallback_balance: dec!(10000),
        }
    }
}

struct BalanceCell {
    total: Decimal,
    available: Decimal,
    reserved: Decimal,
}

/// Simulated execution venue backed by aggregator books.
pub struct PaperVenue {
    aggregator: Arc<MarketDataAggregator>,
    fees: HashMap<String, FeeSchedule>,
    fallback_balance: Decimal,
    balances: Mutex<HashMap<(String, String), BalanceCell>>,
    orders: Mutex<HashMap<String, Order>>,
    history: Mutex<Vec<TradeExecution>>,
    reject_next: Mutex<HashSet<(String, Side)>>,
}

impl PaperVenue {
    /// Creates the venue over the aggregator's book state.
    #[must_use]
    pub fn new(aggregator: Arc<MarketDataAggregator>, config: PaperVenueConfig) -> Self {
        let mut balances = HashMap::new();
        for seed in &config.initial_balances {
            balances.insert(
                (seed.exchange_id.clone(), seed.currency.to_uppercase()),
                BalanceCell {
                    total: seed.amount,
                    available: seed.amount,
                    reserved: Decimal::ZERO,
                },
            );
        }
        info!(seeded = balances.len(), "Paper venue initialized");

        Self {
            aggregator,
            fees: config
                .fees
                .into_iter()
                .map(|schedule| (schedule.exchange_id.clone(), schedule))
                .collect(),
            fallback_balance: config.fallback_balance,
            balances: Mutex::new(balances),
            orders: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            reject_next: Mutex::new(HashSet::new()),
        }
    }

    /// Forces the next order on `(exchange, side)` to reject. Test hook for
    /// leg-failure scenarios.
    pub fn reject_next_order(&self, exchange_id: &str, side: Side) {
        self.reject_next
            .lock()
            .insert((exchange_id.to_string(), side));
    }

    /// Snapshot of all simulated balances.
    #[must_use]
    pub fn balances(&self) -> Vec<Balance> {
        let now = Utc::now();
        self.balances
            .lock()
            .iter()
            .map(|((exchange, currency), cell)| Balance {
                exchange_id: exchange.clone(),
                currency: currency.clone(),
                total: cell.total,
                available: cell.available,
                reserved: cell.reserved,
                timestamp: now,
            })
            .collect()
    }

    /// All simulated fills, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<TradeExecution> {
        self.history.lock().clone()
    }

    fn taker_rate(&self, exchange_id: &str) -> Decimal {
        self.fees
            .get(exchange_id)
            .map_or(Decimal::ZERO, |schedule| schedule.taker_rate)
    }

    fn with_balance<R>(
        &self,
        exchange_id: &str,
        currency: &str,
        f: impl FnOnce(&mut BalanceCell) -> R,
    ) -> R {
        let key = (exchange_id.to_string(), currency.to_uppercase());
        let mut balances = self.balances.lock();
        let fallback = self.fallback_balance;
        let cell = balances.entry(key).or_insert_with(|| BalanceCell {
            total: fallback,
            available: fallback,
            reserved: Decimal::ZERO,
        });
        f(cell)
    }

    fn simulate_fill(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<Order, ExchangeError> {
        if self
            .reject_next
            .lock()
            .remove(&(exchange_id.to_string(), side))
        {
            return Err(ExchangeError::OrderRejected(
                "injected rejection".to_string(),
            ));
        }

        let books = self.aggregator.latest(pair);
        let book = books.get(exchange_id).ok_or_else(|| {
            ExchangeError::transport(format!("no book for {pair} on {exchange_id}"))
        })?;
        let best = match side {
            Side::Buy => book.best_ask(),
            Side::Sell => book.best_bid(),
        }
        .ok_or_else(|| {
            ExchangeError::transport(format!("empty book side for {pair} on {exchange_id}"))
        })?;

        let now = Utc::now();
        let order_id = format!("paper-{}", Uuid::new_v4());

        // A non-marketable limit rests with zero execution.
        if let Some(limit) = limit_price {
            let marketable = match side {
                Side::Buy => limit >= best.price,
                Side::Sell => limit <= best.price,
            };
            if !marketable {
                let order = Order {
                    id: order_id.clone(),
                    exchange_id: exchange_id.to_string(),
                    pair: pair.clone(),
                    side,
                    order_type: OrderType::Limit,
                    status: OrderStatus::New,
                    price: Some(limit),
                    quantity,
                    filled_quantity: Decimal::ZERO,
                    avg_fill_price: None,
                    created_at: now,
                    last_updated: now,
                };
                self.orders.lock().insert(order_id, order.clone());
                debug!(exchange = %exchange_id, side = %side, "Limit order resting open");
                return Ok(order);
            }
        }

        let fill_price = best.price;
        let notional = fill_price * quantity;
        let fee = notional * self.taker_rate(exchange_id);

        // Single-writer balance update under the venue mutex.
        match side {
            Side::Buy => {
                let needed = notional + fee;
                let ok = self.with_balance(exchange_id, pair.quote(), |cell| {
                    if cell.available < needed {
                        return Err(ExchangeError::insufficient_balance(
                            pair.quote(),
                            needed,
                            cell.available,
                        ));
                    }
                    cell.available -= needed;
                    cell.total -= needed;
                    Ok(())
                });
                ok?;
                self.with_balance(exchange_id, pair.base(), |cell| {
                    cell.available += quantity;
                    cell.total += quantity;
                });
            }
            Side::Sell => {
                let ok = self.with_balance(exchange_id, pair.base(), |cell| {
                    if cell.available < quantity {
                        return Err(ExchangeError::insufficient_balance(
                            pair.base(),
                            quantity,
                            cell.available,
                        ));
                    }
                    cell.available -= quantity;
                    cell.total -= quantity;
                    Ok(())
                });
                ok?;
                self.with_balance(exchange_id, pair.quote(), |cell| {
                    let proceeds = notional - fee;
                    cell.available += proceeds;
                    cell.total += proceeds;
                });
            }
        }

        let order = Order {
            id: order_id.clone(),
            exchange_id: exchange_id.to_string(),
            pair: pair.clone(),
            side,
            order_type: if limit_price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            status: OrderStatus::Filled,
            price: limit_price,
            quantity,
            filled_quantity: quantity,
            avg_fill_price: Some(fill_price),
            created_at: now,
            last_updated: now,
        };
        self.orders.lock().insert(order_id, order.clone());

        self.history.lock().push(TradeExecution {
            trade_id: Uuid::new_v4(),
            exchange_id: exchange_id.to_string(),
            pair: pair.clone(),
            side,
            order_type: order.order_type,
            price: fill_price,
            quantity,
            fee,
            fee_currency: pair.quote().to_string(),
            timestamp: now,
            opportunity_id: None,
        });

        debug!(
            exchange = %exchange_id,
            side = %side,
            price = %fill_price,
            quantity = %quantity,
            fee = %fee,
            "Simulated fill"
        );
        Ok(order)
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn place_market_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order, ExchangeError> {
        self.simulate_fill(exchange_id, pair, side, quantity, None)
    }

    async fn place_limit_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, ExchangeError> {
        self.simulate_fill(exchange_id, pair, side, quantity, Some(price))
    }

    async fn cancel_order(
        &self,
        _exchange_id: &str,
        _pair: &TradingPair,
        order_id: &str,
    ) -> Result<Order, ExchangeError> {
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Canceled;
            order.last_updated = Utc::now();
        }
        Ok(order.clone())
    }

    async fn get_order(
        &self,
        _exchange_id: &str,
        _pair: &TradingPair,
        order_id: &str,
    ) -> Result<Order, ExchangeError> {
        self.orders
            .lock()
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    async fn available_balance(
        &self,
        exchange_id: &str,
        currency: &str,
    ) -> Result<Decimal, ExchangeError> {
        Ok(self.with_balance(exchange_id, currency, |cell| cell.available))
    }

    async fn fee_schedule(&self, exchange_id: &str) -> Result<FeeSchedule, ExchangeError> {
        Ok(self
            .fees
            .get(exchange_id)
            .cloned()
            .unwrap_or_else(|| FeeSchedule::new(exchange_id, Decimal::ZERO, Decimal::ZERO)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::detector::{DetectorConfig, OpportunityDetector};
    use crate::executor::{ExecutorConfig, TradeExecutor};
    use crate::risk::RiskManager;
    use crate::types::NullStore;
    use crate::aggregator::BookTick;
    use cross_arb_core::{OrderBook, RiskProfile};
    use std::time::Duration;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn seeded_aggregator(kraken_bid: Decimal) -> Arc<MarketDataAggregator> {
        let aggregator = Arc::new(MarketDataAggregator::new(AggregatorConfig::default()));
        let now = Utc::now();

        let mut coinbase = OrderBook::new("coinbase", pair());
        coinbase.apply_snapshot(
            vec![(dec!(49990), dec!(1.0))],
            vec![(dec!(50000), dec!(1.0))],
            now,
        );
        aggregator.ingest(coinbase);

        let mut kraken = OrderBook::new("kraken", pair());
        kraken.apply_snapshot(
            vec![(kraken_bid, dec!(0.5))],
            vec![(kraken_bid + dec!(20), dec!(0.5))],
            now,
        );
        aggregator.ingest(kraken);
        aggregator
    }

    fn venue(aggregator: Arc<MarketDataAggregator>) -> Arc<PaperVenue> {
        Arc::new(PaperVenue::new(
            aggregator,
            PaperVenueConfig {
                initial_balances: vec![
                    PaperBalance {
                        exchange_id: "coinbase".to_string(),
                        currency: "USDT".to_string(),
                        amount: dec!(100000),
                    },
                    PaperBalance {
                        exchange_id: "kraken".to_string(),
                        currency: "BTC".to_string(),
                        amount: dec!(2),
                    },
                ],
                fees: vec![
                    FeeSchedule::new("coinbase", dec!(0.0005), dec!(0.001)),
                    FeeSchedule::new("kraken", dec!(0.0016), dec!(0.001)),
                ],
                fallback_balance: dec!(10000),
            },
        ))
    }

    fn executor(venue: Arc<PaperVenue>) -> TradeExecutor {
        let risk = Arc::new(RiskManager::new(
            RiskProfile {
                max_concurrent_trades: 4,
                ..RiskProfile::aggressive()
            },
            dec!(10_000_000),
        ));
        TradeExecutor::new(
            venue,
            Arc::new(NullStore),
            risk,
            ExecutorConfig {
                max_execution_time: Duration::from_millis(500),
                poll_interval: Duration::from_millis(10),
                ..ExecutorConfig::default()
            },
        )
    }

    // ==================== Fill Mechanics ====================

    #[tokio::test]
    async fn test_market_buy_fills_at_best_ask() {
        let venue = venue(seeded_aggregator(dec!(50200)));
        let order = venue
            .place_market_order("coinbase", &pair(), Side::Buy, dec!(0.5))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(50000)));

        // 0.5 * 50000 = 25000 plus 25 fee leaves 74975.
        assert_eq!(
            venue.available_balance("coinbase", "USDT").await.unwrap(),
            dec!(74975)
        );
        assert_eq!(
            venue.available_balance("coinbase", "BTC").await.unwrap(),
            dec!(10000.5)
        );
        assert_eq!(venue.history().len(), 1);
        assert_eq!(venue.history()[0].fee, dec!(25));
    }

    #[tokio::test]
    async fn test_market_sell_fills_at_best_bid() {
        let venue = venue(seeded_aggregator(dec!(50200)));
        let order = venue
            .place_market_order("kraken", &pair(), Side::Sell, dec!(0.5))
            .await
            .unwrap();
        assert_eq!(order.avg_fill_price, Some(dec!(50200)));

        // Proceeds 25100 minus 25.1 fee on a 10000 fallback quote balance.
        assert_eq!(
            venue.available_balance("kraken", "USDT").await.unwrap(),
            dec!(35074.9)
        );
        assert_eq!(
            venue.available_balance("kraken", "BTC").await.unwrap(),
            dec!(1.5)
        );
    }

    #[tokio::test]
    async fn test_balances_stay_consistent() {
        let venue = venue(seeded_aggregator(dec!(50200)));
        let _ = venue
            .place_market_order("coinbase", &pair(), Side::Buy, dec!(0.5))
            .await
            .unwrap();
        let _ = venue
            .place_market_order("kraken", &pair(), Side::Sell, dec!(0.5))
            .await
            .unwrap();
        for balance in venue.balances() {
            assert!(balance.is_consistent(), "inconsistent: {balance:?}");
        }
    }

    #[tokio::test]
    async fn test_non_marketable_limit_rests_open() {
        let venue = venue(seeded_aggregator(dec!(50200)));
        // Buy limit 100 below the ask cannot cross.
        let order = venue
            .place_limit_order("coinbase", &pair(), Side::Buy, dec!(49900), dec!(0.5))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.filled_quantity, Decimal::ZERO);
        // Nothing moved.
        assert_eq!(
            venue.available_balance("coinbase", "USDT").await.unwrap(),
            dec!(100000)
        );

        // It can be canceled like any live order.
        let canceled = venue
            .cancel_order("coinbase", &pair(), &order.id)
            .await
            .unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn test_marketable_limit_fills_at_book() {
        let venue = venue(seeded_aggregator(dec!(50200)));
        let order = venue
            .place_limit_order("coinbase", &pair(), Side::Buy, dec!(50100), dec!(0.5))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        // Fills at the book ask, not the limit.
        assert_eq!(order.avg_fill_price, Some(dec!(50000)));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejects() {
        let venue = venue(seeded_aggregator(dec!(50200)));
        let err = venue
            .place_market_order("coinbase", &pair(), Side::Buy, dec!(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
    }

    // ==================== End-to-End Scenarios ====================

    #[tokio::test]
    async fn test_thin_spread_dropped_by_detector() {
        // kraken bid 50100: gross 50, fees 50.05, net -0.05 -> no emission.
        let aggregator = seeded_aggregator(dec!(50100));
        let detector = OpportunityDetector::new(DetectorConfig::default()).with_fees(vec![
            FeeSchedule::new("coinbase", dec!(0.0005), dec!(0.001)),
            FeeSchedule::new("kraken", dec!(0.0016), dec!(0.001)),
        ]);
        let tick = BookTick {
            pair: pair(),
            updated_exchange: "kraken".to_string(),
            books: aggregator.latest(&pair()),
        };
        assert!(detector.detect(&tick, Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_profitable_spread_executes_on_paper() {
        // kraken bid 50200: net 49.9 detected, executed, is_success=true.
        let aggregator = seeded_aggregator(dec!(50200));
        let detector = OpportunityDetector::new(DetectorConfig::default()).with_fees(vec![
            FeeSchedule::new("coinbase", dec!(0.0005), dec!(0.001)),
            FeeSchedule::new("kraken", dec!(0.0016), dec!(0.001)),
        ]);
        let tick = BookTick {
            pair: pair(),
            updated_exchange: "kraken".to_string(),
            books: aggregator.latest(&pair()),
        };
        let opportunity = detector.detect(&tick, Utc::now()).unwrap();
        assert_eq!(opportunity.est_profit_quote, dec!(49.9));
        assert_eq!(opportunity.spread_pct, dec!(0.4));

        let venue = venue(Arc::clone(&aggregator));
        let executor = executor(Arc::clone(&venue));
        let result = executor.execute(opportunity).await;

        assert!(result.is_success);
        assert_eq!(result.profit, dec!(49.9));
        assert!(result.execution_time_ms < 5000);
        assert_eq!(venue.history().len(), 2);
    }

    #[tokio::test]
    async fn test_sell_leg_rejection_flattens_at_loss() {
        let aggregator = seeded_aggregator(dec!(50200));
        let venue = venue(Arc::clone(&aggregator));
        venue.reject_next_order("kraken", Side::Sell);

        let detector = OpportunityDetector::new(DetectorConfig::default()).with_fees(vec![
            FeeSchedule::new("coinbase", dec!(0.0005), dec!(0.001)),
            FeeSchedule::new("kraken", dec!(0.0016), dec!(0.001)),
        ]);
        let tick = BookTick {
            pair: pair(),
            updated_exchange: "kraken".to_string(),
            books: aggregator.latest(&pair()),
        };
        let opportunity = detector.detect(&tick, Utc::now()).unwrap();

        let executor = executor(Arc::clone(&venue));
        let result = executor.execute(opportunity).await;

        assert!(!result.is_success);
        assert!(result.error.is_some());
        // Bought at 50000, flattened at the 49990 bid: loss is roughly the
        // crossing spread plus fees on both fills.
        assert!(result.profit < Decimal::ZERO);
        assert!(result.profit > dec!(-60));
        // History shows the buy plus the flattening sell, both on coinbase.
        let history = venue.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.exchange_id == "coinbase"));
    }
}
