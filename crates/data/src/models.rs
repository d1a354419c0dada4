//! Row types and conversions between domain values and storage records.

use chrono::{DateTime, Utc};
use cross_arb_core::{OrderType, Side, TradeExecution, TradeResult, TradingPair};
use cross_arb_engine::{ArbitrageOpportunity, OpportunityStatus};
use rust_decimal::Decimal;
use uuid::Uuid;

/// One row of the `opportunities` collection.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OpportunityRecord {
    pub id: Uuid,
    pub pair: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub effective_quantity: Decimal,
    pub spread_abs: Decimal,
    pub spread_pct: Decimal,
    pub est_profit_quote: Decimal,
    pub est_fees_quote: Decimal,
    pub detected_at: DateTime<Utc>,
    pub status: String,
    pub miss_reason: Option<String>,
}

impl OpportunityRecord {
    /// Builds a record from a domain opportunity and optional miss reason.
    #[must_use]
    pub fn from_domain(opportunity: &ArbitrageOpportunity, reason: Option<&str>) -> Self {
        Self {
            id: opportunity.id,
            pair: opportunity.pair.to_string(),
            buy_exchange: opportunity.buy_exchange.clone(),
            sell_exchange: opportunity.sell_exchange.clone(),
            buy_price: opportunity.buy_price,
            sell_price: opportunity.sell_price,
            effective_quantity: opportunity.effective_quantity,
            spread_abs: opportunity.spread_abs,
            spread_pct: opportunity.spread_pct,
            est_profit_quote: opportunity.est_profit_quote,
            est_fees_quote: opportunity.est_fees_quote,
            detected_at: opportunity.detected_at,
            status: opportunity.status.as_str().to_string(),
            miss_reason: reason.map(String::from),
        }
    }

    /// Reconstructs the domain opportunity.
    ///
    /// # Errors
    /// Returns an error when the pair or status string is malformed.
    pub fn into_domain(self) -> anyhow::Result<ArbitrageOpportunity> {
        let pair: TradingPair = self
            .pair
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let status = match self.status.as_str() {
            "detected" => OpportunityStatus::Detected,
            "executing" => OpportunityStatus::Executing,
            "executed" => OpportunityStatus::Executed,
            "failed" => OpportunityStatus::Failed,
            "missed" => OpportunityStatus::Missed,
            other => anyhow::bail!("unknown opportunity status: {other}"),
        };
        Ok(ArbitrageOpportunity {
            id: self.id,
            pair,
            buy_exchange: self.buy_exchange,
            sell_exchange: self.sell_exchange,
            buy_price: self.buy_price,
            sell_price: self.sell_price,
            effective_quantity: self.effective_quantity,
            spread_abs: self.spread_abs,
            spread_pct: self.spread_pct,
            est_profit_quote: self.est_profit_quote,
            est_fees_quote: self.est_fees_quote,
            detected_at: self.detected_at,
            status,
        })
    }
}

/// One row of the `trades` collection, legs flattened into columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TradeRecord {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub pair: String,
    pub is_success: bool,
    pub profit: Decimal,
    pub profit_pct: Decimal,
    pub error: Option<String>,
    pub execution_time_ms: i64,
    pub buy_exchange: Option<String>,
    pub buy_price: Option<Decimal>,
    pub buy_quantity: Option<Decimal>,
    pub buy_fee: Option<Decimal>,
    pub sell_exchange: Option<String>,
    pub sell_price: Option<Decimal>,
    pub sell_quantity: Option<Decimal>,
    pub sell_fee: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Builds a record from a domain trade result.
    #[must_use]
    pub fn from_domain(trade: &TradeResult) -> Self {
        let pair = trade
            .buy_execution
            .as_ref()
            .or(trade.sell_execution.as_ref())
            .map(|execution| execution.pair.to_string())
            .unwrap_or_default();
        Self {
            id: trade.id,
            opportunity_id: trade.opportunity_id,
            pair,
            is_success: trade.is_success,
            profit: trade.profit,
            profit_pct: trade.profit_pct,
            error: trade.error.clone(),
            execution_time_ms: i64::try_from(trade.execution_time_ms).unwrap_or(i64::MAX),
            buy_exchange: trade.buy_execution.as_ref().map(|e| e.exchange_id.clone()),
            buy_price: trade.buy_execution.as_ref().map(|e| e.price),
            buy_quantity: trade.buy_execution.as_ref().map(|e| e.quantity),
            buy_fee: trade.buy_execution.as_ref().map(|e| e.fee),
            sell_exchange: trade.sell_execution.as_ref().map(|e| e.exchange_id.clone()),
            sell_price: trade.sell_execution.as_ref().map(|e| e.price),
            sell_quantity: trade.sell_execution.as_ref().map(|e| e.quantity),
            sell_fee: trade.sell_execution.as_ref().map(|e| e.fee),
            executed_at: trade.timestamp,
        }
    }

    /// Reconstructs the domain trade result.
    ///
    /// # Errors
    /// Returns an error when the pair string is malformed while a leg is
    /// present.
    pub fn into_domain(self) -> anyhow::Result<TradeResult> {
        let pair: Option<TradingPair> = if self.pair.is_empty() {
            None
        } else {
            Some(self.pair.parse().map_err(|e: String| anyhow::anyhow!(e))?)
        };

        let leg = |exchange: &Option<String>,
                   price: Option<Decimal>,
                   quantity: Option<Decimal>,
                   fee: Option<Decimal>,
                   side: Side|
         -> Option<TradeExecution> {
            let exchange = exchange.clone()?;
            Some(TradeExecution {
                trade_id: self.id,
                exchange_id: exchange,
                pair: pair.clone()?,
                side,
                order_type: OrderType::Market,
                price: price?,
                quantity: quantity?,
                fee: fee.unwrap_or(Decimal::ZERO),
                fee_currency: pair.as_ref()?.quote().to_string(),
                timestamp: self.executed_at,
                opportunity_id: Some(self.opportunity_id),
            })
        };

        Ok(TradeResult {
            id: self.id,
            opportunity_id: self.opportunity_id,
            is_success: self.is_success,
            buy_execution: leg(
                &self.buy_exchange,
                self.buy_price,
                self.buy_quantity,
                self.buy_fee,
                Side::Buy,
            ),
            sell_execution: leg(
                &self.sell_exchange,
                self.sell_price,
                self.sell_quantity,
                self.sell_fee,
                Side::Sell,
            ),
            profit: self.profit,
            profit_pct: self.profit_pct,
            error: self.error,
            execution_time_ms: u64::try_from(self.execution_time_ms).unwrap_or(0),
            timestamp: self.executed_at,
        })
    }
}

/// One row of the `statistics` collection.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatisticsRecord {
    pub pair: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub opportunities_detected: i64,
    pub opportunities_missed: i64,
    pub trades_executed: i64,
    pub trades_succeeded: i64,
    pub total_profit: Decimal,
    pub avg_spread_pct: Option<Decimal>,
}

impl StatisticsRecord {
    /// Success rate over executed trades, if any ran.
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        if self.trades_executed == 0 {
            return None;
        }
        Some(self.trades_succeeded as f64 / self.trades_executed as f64)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn opportunity() -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            id: Uuid::new_v4(),
            pair: TradingPair::new("BTC", "USDT"),
            buy_exchange: "coinbase".to_string(),
            sell_exchange: "kraken".to_string(),
            buy_price: dec!(50000),
            sell_price: dec!(50200),
            effective_quantity: dec!(0.5),
            spread_abs: dec!(200),
            spread_pct: dec!(0.4),
            est_profit_quote: dec!(49.9),
            est_fees_quote: dec!(50.1),
            detected_at: Utc::now(),
            status: OpportunityStatus::Detected,
        }
    }

    fn execution(side: Side, exchange: &str, price: Decimal) -> TradeExecution {
        TradeExecution {
            trade_id: Uuid::new_v4(),
            exchange_id: exchange.to_string(),
            pair: TradingPair::new("BTC", "USDT"),
            side,
            order_type: OrderType::Market,
            price,
            quantity: dec!(0.5),
            fee: dec!(25),
            fee_currency: "USDT".to_string(),
            timestamp: Utc::now(),
            opportunity_id: None,
        }
    }

    #[test]
    fn test_opportunity_round_trip() {
        let original = opportunity();
        let record = OpportunityRecord::from_domain(&original, None);
        let restored = record.into_domain().unwrap();

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.pair, original.pair);
        assert_eq!(restored.buy_price, original.buy_price);
        assert_eq!(restored.est_profit_quote, original.est_profit_quote);
        assert_eq!(restored.status, OpportunityStatus::Detected);
    }

    #[test]
    fn test_missed_record_keeps_reason() {
        let mut missed = opportunity();
        missed.status = OpportunityStatus::Missed;
        let record = OpportunityRecord::from_domain(&missed, Some("max_concurrent_trades"));
        assert_eq!(record.status, "missed");
        assert_eq!(record.miss_reason.as_deref(), Some("max_concurrent_trades"));
        assert_eq!(
            record.into_domain().unwrap().status,
            OpportunityStatus::Missed
        );
    }

    #[test]
    fn test_trade_round_trip_with_legs() {
        let original = TradeResult {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            is_success: true,
            buy_execution: Some(execution(Side::Buy, "coinbase", dec!(50000))),
            sell_execution: Some(execution(Side::Sell, "kraken", dec!(50200))),
            profit: dec!(49.9),
            profit_pct: dec!(0.1996),
            error: None,
            execution_time_ms: 120,
            timestamp: Utc::now(),
        };

        let record = TradeRecord::from_domain(&original);
        assert_eq!(record.pair, "BTC/USDT");
        let restored = record.into_domain().unwrap();

        assert_eq!(restored.id, original.id);
        assert!(restored.is_success);
        assert_eq!(restored.profit, original.profit);
        let buy = restored.buy_execution.unwrap();
        assert_eq!(buy.exchange_id, "coinbase");
        assert_eq!(buy.price, dec!(50000));
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(restored.sell_execution.unwrap().price, dec!(50200));
    }

    #[test]
    fn test_trade_without_legs_round_trips() {
        let original = TradeResult {
            id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            is_success: false,
            buy_execution: None,
            sell_execution: None,
            profit: Decimal::ZERO,
            profit_pct: Decimal::ZERO,
            error: Some("insufficient balance".to_string()),
            execution_time_ms: 3,
            timestamp: Utc::now(),
        };
        let restored = TradeRecord::from_domain(&original).into_domain().unwrap();
        assert!(!restored.is_success);
        assert!(restored.buy_execution.is_none());
        assert_eq!(restored.error.as_deref(), Some("insufficient balance"));
    }

    #[test]
    fn test_statistics_success_rate() {
        let record = StatisticsRecord {
            pair: Some("BTC/USDT".to_string()),
            window_start: Utc::now(),
            window_end: Utc::now(),
            opportunities_detected: 100,
            opportunities_missed: 40,
            trades_executed: 10,
            trades_succeeded: 8,
            total_profit: dec!(320),
            avg_spread_pct: Some(dec!(0.31)),
        };
        assert_eq!(record.success_rate(), Some(0.8));

        let empty = StatisticsRecord {
            trades_executed: 0,
            trades_succeeded: 0,
            ..record
        };
        assert!(empty.success_rate().is_none());
    }
}
