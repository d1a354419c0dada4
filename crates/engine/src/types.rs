//! Opportunity types and the repository surface used by the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cross_arb_core::{TradeResult, TradingPair};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a detected opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    /// Qualified by the detector, not yet acted on.
    Detected,
    /// Handed to the executor.
    Executing,
    /// Both legs reconciled successfully.
    Executed,
    /// Execution attempted and failed.
    Failed,
    /// Rejected by risk or dropped before execution.
    Missed,
}

impl OpportunityStatus {
    /// Storage string for the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Missed => "missed",
        }
    }
}

impl std::fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A qualified cross-exchange price dislocation.
///
/// Immutable after emission except for `status`, which advances through the
/// execution pipeline. Invariants on emission: `sell_price > buy_price`,
/// `buy_exchange != sell_exchange`, `est_profit_quote >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    /// Unique id.
    pub id: Uuid,
    /// Pair traded.
    pub pair: TradingPair,
    /// Exchange with the cheaper ask.
    pub buy_exchange: String,
    /// Exchange with the richer bid.
    pub sell_exchange: String,
    /// Best ask on the buy exchange.
    pub buy_price: Decimal,
    /// Best bid on the sell exchange.
    pub sell_price: Decimal,
    /// Tradeable size: `min(ask_qty, bid_qty, capital_cap / buy_price)`.
    pub effective_quantity: Decimal,
    /// Absolute spread per unit.
    pub spread_abs: Decimal,
    /// Spread as a percent of the buy price.
    pub spread_pct: Decimal,
    /// Estimated net profit in quote units, after fees.
    pub est_profit_quote: Decimal,
    /// Estimated taker fees across both legs, in quote units.
    pub est_fees_quote: Decimal,
    /// Timestamp of the newer of the two source books.
    pub detected_at: DateTime<Utc>,
    /// Pipeline status.
    pub status: OpportunityStatus,
}

impl ArbitrageOpportunity {
    /// Notional of the buy leg in quote units.
    #[must_use]
    pub fn buy_notional(&self) -> Decimal {
        self.buy_price * self.effective_quantity
    }

    /// Notional of the sell leg in quote units.
    #[must_use]
    pub fn sell_notional(&self) -> Decimal {
        self.sell_price * self.effective_quantity
    }

    /// Gross profit before fees.
    #[must_use]
    pub fn gross_profit(&self) -> Decimal {
        (self.sell_price - self.buy_price) * self.effective_quantity
    }

    /// Emission invariants hold.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.sell_price > self.buy_price
            && self.buy_exchange != self.sell_exchange
            && self.effective_quantity > Decimal::ZERO
            && self.est_profit_quote >= Decimal::ZERO
    }

    /// Return on the buy notional, percent.
    #[must_use]
    pub fn roi_pct(&self) -> Decimal {
        let notional = self.buy_notional();
        if notional == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.est_profit_quote / notional * dec!(100)
    }
}

/// Repository surface the pipeline writes through.
///
/// Both the live store and the paper-trading in-memory store implement this,
/// so results are queryable the same way in either mode.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Persists an opportunity, idempotent by id. `reason` carries the risk
    /// rejection code for `Missed` records.
    async fn save_opportunity(
        &self,
        opportunity: &ArbitrageOpportunity,
        reason: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Persists a trade result, idempotent by id.
    async fn save_trade(&self, trade: &TradeResult) -> anyhow::Result<()>;
}

/// A no-op store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct NullStore;

#[async_trait]
impl OpportunityStore for NullStore {
    async fn save_opportunity(
        &self,
        _opportunity: &ArbitrageOpportunity,
        _reason: Option<&str>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_trade(&self, _trade: &TradeResult) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_notionals_and_gross() {
        let opp = opportunity();
        assert_eq!(opp.buy_notional(), dec!(25000));
        assert_eq!(opp.sell_notional(), dec!(25100));
        assert_eq!(opp.gross_profit(), dec!(100));
    }

    #[test]
    fn test_validity() {
        let opp = opportunity();
        assert!(opp.is_valid());

        let mut bad = opportunity();
        bad.sell_price = bad.buy_price;
        assert!(!bad.is_valid());

        let mut bad = opportunity();
        bad.sell_exchange = bad.buy_exchange.clone();
        assert!(!bad.is_valid());

        let mut bad = opportunity();
        bad.est_profit_quote = dec!(-1);
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_roi() {
        let opp = opportunity();
        // 49.9 / 25000 * 100 ≈ 0.1996%
        assert!(opp.roi_pct() > dec!(0.19) && opp.roi_pct() < dec!(0.20));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(OpportunityStatus::Detected.as_str(), "detected");
        assert_eq!(OpportunityStatus::Missed.as_str(), "missed");
        assert_eq!(OpportunityStatus::Executed.to_string(), "executed");
    }

    #[test]
    fn test_serialization_round_trip() {
        let opp = opportunity();
        let json = serde_json::to_string(&opp).unwrap();
        let back: ArbitrageOpportunity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, opp.id);
        assert_eq!(back.est_profit_quote, opp.est_profit_quote);
        assert_eq!(back.status, OpportunityStatus::Detected);
    }
}
