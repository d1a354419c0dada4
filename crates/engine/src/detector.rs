//! Cross-exchange opportunity detection.
//!
//! Detection is a pure function of the books, fee schedules, and thresholds:
//! the same inputs always produce the same output, and nothing here touches
//! a clock other than the `now` the caller passes in.

use crate::aggregator::BookTick;
use crate::types::{ArbitrageOpportunity, OpportunityStatus};
use chrono::{DateTime, Utc};
use cross_arb_core::FeeSchedule;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

/// Thresholds for detection.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Minimum spread percent for an opportunity to qualify.
    pub min_profit_pct: Decimal,
    /// Minimum tradeable quantity in base units.
    pub min_trade_quantity: Decimal,
    /// Capital cap in quote units; bounds quantity by `cap / buy_price`.
    pub capital_cap_quote: Option<Decimal>,
    /// Expected book update cadence; books older than twice this are stale.
    pub expected_tick_interval_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_profit_pct: dec!(0.1),
            min_trade_quantity: dec!(0.0001),
            capital_cap_quote: None,
            expected_tick_interval_ms: 500,
        }
    }
}

struct Candidate {
    buy_exchange: String,
    sell_exchange: String,
    buy_price: Decimal,
    sell_price: Decimal,
    quantity: Decimal,
    net_profit: Decimal,
    fees: Decimal,
    detected_at: DateTime<Utc>,
    oldest_book_age_ms: i64,
}

/// Detects the best cross-exchange opportunity per book tick.
#[derive(Debug, Clone)]
pub struct OpportunityDetector {
    config: DetectorConfig,
    fees: HashMap<String, FeeSchedule>,
}

impl OpportunityDetector {
    /// Creates a detector with no fee schedules loaded.
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            fees: HashMap::new(),
        }
    }

    /// Sets the fee schedules used for net-profit estimation.
    #[must_use]
    pub fn with_fees(mut self, fees: Vec<FeeSchedule>) -> Self {
        self.fees = fees
            .into_iter()
            .map(|schedule| (schedule.exchange_id.clone(), schedule))
            .collect();
        self
    }

    /// Replaces the thresholds, e.g. after a configuration update.
    pub fn set_config(&mut self, config: DetectorConfig) {
        self.config = config;
    }

    /// Current thresholds.
    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn taker_rate(&self, exchange: &str) -> Decimal {
        self.fees
            .get(exchange)
            .map_or(Decimal::ZERO, |schedule| schedule.taker_rate)
    }

    /// Computes the best qualifying opportunity for a tick, if any.
    ///
    /// Candidates are every ordered exchange pair with both books present
    /// and a positive net profit after taker fees; the one with maximum net
    /// profit wins, tie-broken by larger quantity and then lexicographic
    /// `(buy, sell)`. The winner must still pass the spread, quantity, and
    /// staleness filters.
    #[must_use]
    pub fn detect(&self, tick: &BookTick, now: DateTime<Utc>) -> Option<ArbitrageOpportunity> {
        let mut exchanges: Vec<&String> = tick.books.keys().collect();
        exchanges.sort();

        let mut best: Option<Candidate> = None;

        for buy_exchange in &exchanges {
            for sell_exchange in &exchanges {
                if buy_exchange == sell_exchange {
                    continue;
                }
                let buy_book = &tick.books[*buy_exchange];
                let sell_book = &tick.books[*sell_exchange];
                let (Some(ask), Some(bid)) = (buy_book.best_ask(), sell_book.best_bid()) else {
                    continue;
                };
                if bid.price <= ask.price {
                    continue;
                }

                let mut quantity = ask.quantity.min(bid.quantity);
                if let Some(cap) = self.config.capital_cap_quote {
                    quantity = quantity.min(cap / ask.price);
                }
                if quantity <= Decimal::ZERO {
                    continue;
                }

                let gross = (bid.price - ask.price) * quantity;
                let fees = quantity * ask.price * self.taker_rate(buy_exchange)
                    + quantity * bid.price * self.taker_rate(sell_exchange);
                let net = gross - fees;
                if net <= Decimal::ZERO {
                    trace!(
                        buy = %buy_exchange,
                        sell = %sell_exchange,
                        gross = %gross,
                        fees = %fees,
                        "Spread does not survive fees"
                    );
                    continue;
                }

                let candidate = Candidate {
                    buy_exchange: (*buy_exchange).clone(),
                    sell_exchange: (*sell_exchange).clone(),
                    buy_price: ask.price,
                    sell_price: bid.price,
                    quantity,
                    net_profit: net,
                    fees,
                    detected_at: buy_book.timestamp.max(sell_book.timestamp),
                    oldest_book_age_ms: (now - buy_book.timestamp.min(sell_book.timestamp))
                        .num_milliseconds(),
                };

                let replace = match &best {
                    None => true,
                    Some(current) => {
                        candidate.net_profit > current.net_profit
                            || (candidate.net_profit == current.net_profit
                                && candidate.quantity > current.quantity)
                    }
                };
                if replace {
                    best = Some(candidate);
                }
            }
        }

        let candidate = best?;

        let spread_pct = (candidate.sell_price / candidate.buy_price - Decimal::ONE) * dec!(100);
        if spread_pct < self.config.min_profit_pct {
            debug!(
                spread_pct = %spread_pct,
                min = %self.config.min_profit_pct,
                "Best candidate below profit threshold"
            );
            return None;
        }
        if candidate.quantity < self.config.min_trade_quantity {
            debug!(
                quantity = %candidate.quantity,
                min = %self.config.min_trade_quantity,
                "Best candidate below minimum quantity"
            );
            return None;
        }
        let stale_limit = 2 * i64::try_from(self.config.expected_tick_interval_ms).unwrap_or(i64::MAX);
        if candidate.oldest_book_age_ms > stale_limit {
            debug!(
                age_ms = candidate.oldest_book_age_ms,
                limit_ms = stale_limit,
                "Best candidate uses a stale book"
            );
            return None;
        }

        Some(ArbitrageOpportunity {
            id: Uuid::new_v4(),
            pair: tick.pair.clone(),
            buy_exchange: candidate.buy_exchange,
            sell_exchange: candidate.sell_exchange,
            buy_price: candidate.buy_price,
            sell_price: candidate.sell_price,
            effective_quantity: candidate.quantity,
            spread_abs: candidate.sell_price - candidate.buy_price,
            spread_pct,
            est_profit_quote: candidate.net_profit,
            est_fees_quote: candidate.fees,
            detected_at: candidate.detected_at,
            status: OpportunityStatus::Detected,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cross_arb_core::{OrderBook, TradingPair};

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn book(
        exchange: &str,
        bid: (Decimal, Decimal),
        ask: (Decimal, Decimal),
        timestamp: DateTime<Utc>,
    ) -> OrderBook {
        let mut book = OrderBook::new(exchange, pair());
        book.apply_snapshot(vec![bid], vec![ask], timestamp);
        book
    }

    fn tick(books: Vec<OrderBook>) -> BookTick {
        let updated = books.last().unwrap().exchange_id.clone();
        BookTick {
            pair: pair(),
            updated_exchange: updated,
            books: books
                .into_iter()
                .map(|b| (b.exchange_id.clone(), b))
                .collect(),
        }
    }

    fn detector(min_profit_pct: Decimal) -> OpportunityDetector {
        OpportunityDetector::new(DetectorConfig {
            min_profit_pct,
            min_trade_quantity: dec!(0.0001),
            capital_cap_quote: None,
            expected_tick_interval_ms: 500,
        })
        .with_fees(vec![
            FeeSchedule::new("coinbase", dec!(0.0005), dec!(0.001)),
            FeeSchedule::new("kraken", dec!(0.0016), dec!(0.001)),
        ])
    }

    // ==================== Scenario Tests ====================

    #[test]
    fn test_fees_swallow_thin_spread() {
        // coinbase ask 50000@1.0, kraken bid 50100@0.5, 0.1% both sides:
        // gross 50, fees 50.05, net -0.05 -> dropped.
        let now = Utc::now();
        let tick = tick(vec![
            book("coinbase", (dec!(49990), dec!(1.0)), (dec!(50000), dec!(1.0)), now),
            book("kraken", (dec!(50100), dec!(0.5)), (dec!(50120), dec!(0.5)), now),
        ]);
        assert!(detector(dec!(0.1)).detect(&tick, now).is_none());
    }

    #[test]
    fn test_profitable_spread_detected() {
        // Flip the kraken bid to 50200: gross 100, fees 50.1, net 49.9.
        let now = Utc::now();
        let tick = tick(vec![
            book("coinbase", (dec!(49990), dec!(1.0)), (dec!(50000), dec!(1.0)), now),
            book("kraken", (dec!(50200), dec!(0.5)), (dec!(50220), dec!(0.5)), now),
        ]);
        let opp = detector(dec!(0.1)).detect(&tick, now).unwrap();

        assert_eq!(opp.buy_exchange, "coinbase");
        assert_eq!(opp.sell_exchange, "kraken");
        assert_eq!(opp.buy_price, dec!(50000));
        assert_eq!(opp.sell_price, dec!(50200));
        assert_eq!(opp.effective_quantity, dec!(0.5));
        assert_eq!(opp.est_profit_quote, dec!(49.9));
        assert_eq!(opp.est_fees_quote, dec!(50.1));
        assert_eq!(opp.spread_pct, dec!(0.4));
        assert_eq!(opp.status, OpportunityStatus::Detected);
        assert!(opp.is_valid());
    }

    #[test]
    fn test_staleness_guard_blocks_old_book() {
        // Coinbase book is 10s old with a 500ms expected tick: the large
        // spread must not be used.
        let now = Utc::now();
        let tick = tick(vec![
            book(
                "coinbase",
                (dec!(49990), dec!(1.0)),
                (dec!(50000), dec!(1.0)),
                now - Duration::seconds(10),
            ),
            book("kraken", (dec!(50200), dec!(0.5)), (dec!(50220), dec!(0.5)), now),
        ]);
        assert!(detector(dec!(0.1)).detect(&tick, now).is_none());
    }

    // ==================== Algorithm Tests ====================

    #[test]
    fn test_no_opportunity_when_books_agree() {
        let now = Utc::now();
        let tick = tick(vec![
            book("coinbase", (dec!(49990), dec!(1)), (dec!(50000), dec!(1)), now),
            book("kraken", (dec!(49991), dec!(1)), (dec!(50001), dec!(1)), now),
        ]);
        assert!(detector(dec!(0.0)).detect(&tick, now).is_none());
    }

    #[test]
    fn test_quantity_capped_by_capital() {
        let now = Utc::now();
        let mut detector = detector(dec!(0.1));
        detector.set_config(DetectorConfig {
            capital_cap_quote: Some(dec!(5000)),
            ..detector.config().clone()
        });
        let tick = tick(vec![
            book("coinbase", (dec!(49990), dec!(1.0)), (dec!(50000), dec!(1.0)), now),
            book("kraken", (dec!(50200), dec!(0.5)), (dec!(50220), dec!(0.5)), now),
        ]);
        let opp = detector.detect(&tick, now).unwrap();
        // 5000 / 50000 = 0.1 bounds the 0.5 book quantity.
        assert_eq!(opp.effective_quantity, dec!(0.1));
    }

    #[test]
    fn test_min_quantity_filter() {
        let now = Utc::now();
        let mut d = detector(dec!(0.1));
        d.set_config(DetectorConfig {
            min_trade_quantity: dec!(1.0),
            ..d.config().clone()
        });
        let tick = tick(vec![
            book("coinbase", (dec!(49990), dec!(1.0)), (dec!(50000), dec!(1.0)), now),
            book("kraken", (dec!(50200), dec!(0.5)), (dec!(50220), dec!(0.5)), now),
        ]);
        assert!(d.detect(&tick, now).is_none());
    }

    #[test]
    fn test_picks_max_net_profit_across_three_exchanges() {
        let now = Utc::now();
        let mut d = detector(dec!(0.0));
        d = d.with_fees(vec![
            FeeSchedule::new("alpha", Decimal::ZERO, Decimal::ZERO),
            FeeSchedule::new("beta", Decimal::ZERO, Decimal::ZERO),
            FeeSchedule::new("gamma", Decimal::ZERO, Decimal::ZERO),
        ]);
        let tick = tick(vec![
            book("alpha", (dec!(49950), dec!(1)), (dec!(50000), dec!(1)), now),
            book("beta", (dec!(50100), dec!(1)), (dec!(50150), dec!(1)), now),
            book("gamma", (dec!(50300), dec!(1)), (dec!(50400), dec!(1)), now),
        ]);
        // Best is buy alpha @50000, sell gamma @50300 (net 300).
        let opp = d.detect(&tick, now).unwrap();
        assert_eq!(opp.buy_exchange, "alpha");
        assert_eq!(opp.sell_exchange, "gamma");
        assert_eq!(opp.est_profit_quote, dec!(300));
    }

    #[test]
    fn test_tie_breaks_lexicographically() {
        let now = Utc::now();
        let d = OpportunityDetector::new(DetectorConfig {
            min_profit_pct: Decimal::ZERO,
            ..DetectorConfig::default()
        });
        // beta and gamma both bid 50100 against alpha's 50000 ask with the
        // same quantity: identical net profit, identical quantity. The
        // lexicographically smaller sell exchange (beta) must win.
        let tick = tick(vec![
            book("alpha", (dec!(49990), dec!(1)), (dec!(50000), dec!(1)), now),
            book("gamma", (dec!(50100), dec!(1)), (dec!(50150), dec!(1)), now),
            book("beta", (dec!(50100), dec!(1)), (dec!(50150), dec!(1)), now),
        ]);
        let opp = d.detect(&tick, now).unwrap();
        assert_eq!(opp.buy_exchange, "alpha");
        assert_eq!(opp.sell_exchange, "beta");
    }

    #[test]
    fn test_detection_is_deterministic() {
        let now = Utc::now();
        let d = detector(dec!(0.1));
        let tick = tick(vec![
            book("coinbase", (dec!(49990), dec!(1.0)), (dec!(50000), dec!(1.0)), now),
            book("kraken", (dec!(50200), dec!(0.5)), (dec!(50220), dec!(0.5)), now),
        ]);
        let a = d.detect(&tick, now).unwrap();
        let b = d.detect(&tick, now).unwrap();
        assert_eq!(a.buy_exchange, b.buy_exchange);
        assert_eq!(a.sell_exchange, b.sell_exchange);
        assert_eq!(a.est_profit_quote, b.est_profit_quote);
        assert_eq!(a.effective_quantity, b.effective_quantity);
        assert_eq!(a.detected_at, b.detected_at);
    }

    #[test]
    fn test_detected_at_is_newer_book() {
        let now = Utc::now();
        let older = now - Duration::milliseconds(300);
        let tick = tick(vec![
            book("coinbase", (dec!(49990), dec!(1.0)), (dec!(50000), dec!(1.0)), older),
            book("kraken", (dec!(50200), dec!(0.5)), (dec!(50220), dec!(0.5)), now),
        ]);
        let opp = detector(dec!(0.1)).detect(&tick, now).unwrap();
        assert_eq!(opp.detected_at, now);
    }

    #[test]
    fn test_one_sided_books_ignored() {
        let now = Utc::now();
        let mut empty_ask = OrderBook::new("coinbase", pair());
        empty_ask.apply_snapshot(vec![(dec!(49990), dec!(1))], vec![], now);
        let tick = tick(vec![
            empty_ask,
            book("kraken", (dec!(50200), dec!(0.5)), (dec!(50220), dec!(0.5)), now),
        ]);
        assert!(detector(dec!(0.0)).detect(&tick, now).is_none());
    }
}
