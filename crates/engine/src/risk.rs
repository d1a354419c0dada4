//! Risk gating for detected opportunities.
//!
//! The checks run in a fixed order and the first failure wins; every
//! rejection carries a stable reason code that is persisted with the
//! `Missed` opportunity. Counters live behind a single mutex and are only
//! held for O(1) compare-and-update sequences.

use crate::types::ArbitrageOpportunity;
use chrono::{DateTime, NaiveDate, Utc};
use cross_arb_core::RiskProfile;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Why an opportunity was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RiskRejection {
    /// Spread below the configured minimum.
    #[error("spread {spread_pct}% below minimum {min_pct}%")]
    MinProfit {
        /// Observed spread.
        spread_pct: Decimal,
        /// Required minimum.
        min_pct: Decimal,
    },

    /// Trade notional exceeds the per-trade capital cap.
    #[error("notional {notional} exceeds per-trade cap {cap}")]
    CapitalPerTrade {
        /// Requested notional.
        notional: Decimal,
        /// Allowed maximum.
        cap: Decimal,
    },

    /// Asset exposure would exceed the per-asset cap.
    #[error("exposure {exposure} in {asset} exceeds cap {cap}")]
    AssetExposure {
        /// Base asset.
        asset: String,
        /// Exposure after this trade.
        exposure: Decimal,
        /// Allowed maximum.
        cap: Decimal,
    },

    /// Too many trades already in flight.
    #[error("{open} trades in flight, maximum {max}")]
    MaxConcurrentTrades {
        /// Current open trades.
        open: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The daily realized-loss limit has been reached.
    #[error("daily loss {loss} at limit {limit}")]
    DailyLossLimit {
        /// Realized loss today.
        loss: Decimal,
        /// Allowed maximum.
        limit: Decimal,
    },

    /// The planned limit-price offset exceeds the slippage cap.
    #[error("limit offset {offset_pct}% exceeds slippage cap {cap_pct}%")]
    PriceProtection {
        /// Planned offset from best book.
        offset_pct: Decimal,
        /// Allowed maximum.
        cap_pct: Decimal,
    },
}

impl RiskRejection {
    /// Stable reason code persisted with `Missed` opportunities.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MinProfit { .. } => "min_profit",
            Self::CapitalPerTrade { .. } => "max_capital_per_trade",
            Self::AssetExposure { .. } => "max_capital_per_asset",
            Self::MaxConcurrentTrades { .. } => "max_concurrent_trades",
            Self::DailyLossLimit { .. } => "daily_loss_limit",
            Self::PriceProtection { .. } => "price_protection",
        }
    }
}

struct RiskState {
    open_trades: usize,
    realized_pnl_today: Decimal,
    equity_at_day_start: Decimal,
    day: NaiveDate,
    exposure: HashMap<String, Decimal>,
}

/// Approves or rejects opportunities and tracks execution counters.
pub struct RiskManager {
    profile: RwLock<RiskProfile>,
    equity: RwLock<Decimal>,
    state: Mutex<RiskState>,
}

impl RiskManager {
    /// Creates a manager with the given profile and starting equity.
    #[must_use]
    pub fn new(profile: RiskProfile, equity: Decimal) -> Self {
        Self {
            profile: RwLock::new(profile),
            equity: RwLock::new(equity),
            state: Mutex::new(RiskState {
                open_trades: 0,
                realized_pnl_today: Decimal::ZERO,
                equity_at_day_start: equity,
                day: Utc::now().date_naive(),
                exposure: HashMap::new(),
            }),
        }
    }

    /// Replaces the risk profile; takes effect on the next check.
    pub fn set_profile(&self, profile: RiskProfile) {
        *self.profile.write() = profile;
    }

    /// Updates the equity figure the percentage caps are computed from.
    pub fn set_equity(&self, equity: Decimal) {
        *self.equity.write() = equity;
    }

    /// Runs the ordered checks. Does not reserve capacity; callers pair a
    /// successful approval with [`RiskManager::begin_trade`].
    ///
    /// # Errors
    /// Returns the first failing check.
    pub fn approve(
        &self,
        opportunity: &ArbitrageOpportunity,
        planned_limit_offset_pct: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<(), RiskRejection> {
        let profile = self.profile.read().clone();
        let equity = *self.equity.read();
        let notional = opportunity.buy_notional();

        // 1. Spread threshold.
        if opportunity.spread_pct < profile.min_profit_pct {
            return Err(RiskRejection::MinProfit {
                spread_pct: opportunity.spread_pct,
                min_pct: profile.min_profit_pct,
            });
        }

        // 2. Per-trade capital.
        let trade_cap = profile.max_capital_per_trade_pct / dec!(100) * equity;
        if notional > trade_cap {
            return Err(RiskRejection::CapitalPerTrade {
                notional,
                cap: trade_cap,
            });
        }

        let mut state = self.state.lock();
        Self::roll_day(&mut state, equity, now);

        // 3. Per-asset exposure.
        let asset = opportunity.pair.base().to_string();
        let asset_cap = profile.max_capital_per_asset_pct / dec!(100) * equity;
        let current = state.exposure.get(&asset).copied().unwrap_or(Decimal::ZERO);
        if current + notional > asset_cap {
            return Err(RiskRejection::AssetExposure {
                asset,
                exposure: current + notional,
                cap: asset_cap,
            });
        }

        // 4. Concurrency.
        if state.open_trades >= profile.max_concurrent_trades {
            return Err(RiskRejection::MaxConcurrentTrades {
                open: state.open_trades,
                max: profile.max_concurrent_trades,
            });
        }

        // 5. Daily loss.
        let loss = (-state.realized_pnl_today).max(Decimal::ZERO);
        let loss_limit = profile.daily_loss_limit_pct / dec!(100) * state.equity_at_day_start;
        if loss > loss_limit {
            return Err(RiskRejection::DailyLossLimit {
                loss,
                limit: loss_limit,
            });
        }
        drop(state);

        // 6. Price protection.
        if profile.use_price_protection {
            if let Some(offset_pct) = planned_limit_offset_pct {
                if offset_pct > profile.max_slippage_pct {
                    return Err(RiskRejection::PriceProtection {
                        offset_pct,
                        cap_pct: profile.max_slippage_pct,
                    });
                }
            }
        }

        Ok(())
    }

    /// Reserves one concurrency slot and the trade's asset exposure.
    pub fn begin_trade(&self, opportunity: &ArbitrageOpportunity) {
        let mut state = self.state.lock();
        state.open_trades += 1;
        *state
            .exposure
            .entry(opportunity.pair.base().to_string())
            .or_insert(Decimal::ZERO) += opportunity.buy_notional();
        debug!(open_trades = state.open_trades, "Trade slot reserved");
    }

    /// Releases the slot and records the realized P&L.
    pub fn complete_trade(&self, opportunity: &ArbitrageOpportunity, realized_pnl: Decimal) {
        let mut state = self.state.lock();
        state.open_trades = state.open_trades.saturating_sub(1);
        if let Some(exposure) = state.exposure.get_mut(opportunity.pair.base()) {
            *exposure = (*exposure - opportunity.buy_notional()).max(Decimal::ZERO);
        }
        state.realized_pnl_today += realized_pnl;
        info!(
            pnl = %realized_pnl,
            pnl_today = %state.realized_pnl_today,
            open_trades = state.open_trades,
            "Trade completed"
        );
    }

    /// Trades currently in flight.
    #[must_use]
    pub fn open_trades(&self) -> usize {
        self.state.lock().open_trades
    }

    /// Realized P&L since UTC midnight.
    #[must_use]
    pub fn realized_pnl_today(&self) -> Decimal {
        self.state.lock().realized_pnl_today
    }

    fn roll_day(state: &mut RiskState, equity: Decimal, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != state.day {
            info!(
                day = %today,
                pnl_yesterday = %state.realized_pnl_today,
                "Rolling daily risk counters"
            );
            state.day = today;
            state.realized_pnl_today = Decimal::ZERO;
            state.equity_at_day_start = equity;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpportunityStatus;
    use cross_arb_core::TradingPair;
    use uuid::Uuid;

    fn opportunity(notional_price: Decimal, quantity: Decimal) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            id: Uuid::new_v4(),
            pair: TradingPair::new("BTC", "USDT"),
            buy_exchange: "coinbase".to_string(),
            sell_exchange: "kraken".to_string(),
            buy_price: notional_price,
            sell_price: notional_price + dec!(200),
            effective_quantity: quantity,
            spread_abs: dec!(200),
            spread_pct: dec!(0.4),
            est_profit_quote: dec!(49.9),
            est_fees_quote: dec!(50.1),
            detected_at: Utc::now(),
            status: OpportunityStatus::Detected,
        }
    }

    fn manager() -> RiskManager {
        let profile = RiskProfile {
            max_capital_per_trade_pct: dec!(10),
            max_capital_per_asset_pct: dec!(25),
            min_profit_pct: dec!(0.1),
            max_slippage_pct: dec!(0.25),
            stop_loss_pct: dec!(2),
            daily_loss_limit_pct: dec!(3),
            max_concurrent_trades: 2,
            use_price_protection: true,
        };
        RiskManager::new(profile, dec!(1_000_000))
    }

    #[test]
    fn test_approves_within_limits() {
        let manager = manager();
        let opp = opportunity(dec!(50000), dec!(0.5));
        assert!(manager.approve(&opp, Some(dec!(0.1)), Utc::now()).is_ok());
    }

    #[test]
    fn test_rejects_thin_spread() {
        let manager = manager();
        let mut opp = opportunity(dec!(50000), dec!(0.5));
        opp.spread_pct = dec!(0.05);
        let rejection = manager.approve(&opp, None, Utc::now()).unwrap_err();
        assert_eq!(rejection.reason_code(), "min_profit");
    }

    #[test]
    fn test_rejects_oversized_trade() {
        let manager = manager();
        // 10% of 1M = 100k cap; 4 BTC at 50k = 200k.
        let opp = opportunity(dec!(50000), dec!(4));
        let rejection = manager.approve(&opp, None, Utc::now()).unwrap_err();
        assert_eq!(rejection.reason_code(), "max_capital_per_trade");
    }

    #[test]
    fn test_rejects_asset_exposure() {
        let manager = manager();
        // Asset cap 25% of 1M = 250k. Three 100k trades in flight breach it
        // even though each individually passes the 100k per-trade cap.
        let opp = opportunity(dec!(50000), dec!(2));
        manager.begin_trade(&opp);
        manager.begin_trade(&opp);
        // Reset open_trades pressure by allowing more concurrency.
        manager.set_profile(RiskProfile {
            max_concurrent_trades: 10,
            ..RiskProfile::balanced()
        });
        let rejection = manager.approve(&opp, None, Utc::now()).unwrap_err();
        assert_eq!(rejection.reason_code(), "max_capital_per_asset");
    }

    #[test]
    fn test_rejects_concurrency_at_limit() {
        let manager = manager();
        manager.set_profile(RiskProfile {
            max_concurrent_trades: 1,
            max_capital_per_asset_pct: dec!(100),
            ..RiskProfile::balanced()
        });
        let opp = opportunity(dec!(50000), dec!(0.5));
        manager.begin_trade(&opp);

        let rejection = manager.approve(&opp, None, Utc::now()).unwrap_err();
        assert_eq!(rejection.reason_code(), "max_concurrent_trades");
        assert_eq!(manager.open_trades(), 1);
    }

    #[test]
    fn test_daily_loss_blocks_and_resets_at_midnight() {
        let manager = manager();
        let opp = opportunity(dec!(50000), dec!(0.5));

        // Lose 4% of day-start equity; the 3% limit blocks new trades.
        manager.begin_trade(&opp);
        manager.complete_trade(&opp, dec!(-40000));
        let rejection = manager.approve(&opp, None, Utc::now()).unwrap_err();
        assert_eq!(rejection.reason_code(), "daily_loss_limit");

        // Next UTC day the counters roll and trading resumes.
        let tomorrow = Utc::now() + chrono::Duration::days(1);
        assert!(manager.approve(&opp, None, tomorrow).is_ok());
        assert_eq!(manager.realized_pnl_today(), Decimal::ZERO);
    }

    #[test]
    fn test_price_protection() {
        let manager = manager();
        let opp = opportunity(dec!(50000), dec!(0.5));
        let rejection = manager.approve(&opp, Some(dec!(0.5)), Utc::now()).unwrap_err();
        assert_eq!(rejection.reason_code(), "price_protection");

        // Protection off: the offset no longer matters.
        manager.set_profile(RiskProfile {
            use_price_protection: false,
            max_concurrent_trades: 2,
            ..RiskProfile::balanced()
        });
        assert!(manager.approve(&opp, Some(dec!(0.5)), Utc::now()).is_ok());
    }

    #[test]
    fn test_begin_complete_releases_slot_and_exposure() {
        let manager = manager();
        let opp = opportunity(dec!(50000), dec!(0.5));
        manager.begin_trade(&opp);
        manager.begin_trade(&opp);
        assert_eq!(manager.open_trades(), 2);

        manager.complete_trade(&opp, dec!(49.9));
        assert_eq!(manager.open_trades(), 1);
        assert_eq!(manager.realized_pnl_today(), dec!(49.9));

        manager.complete_trade(&opp, dec!(-10));
        assert_eq!(manager.open_trades(), 0);
        assert_eq!(manager.realized_pnl_today(), dec!(39.9));
    }
}
