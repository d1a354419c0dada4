//! Paired-leg trade execution.
//!
//! The executor places the buy and sell legs of an approved opportunity
//! concurrently, awaits both up to the execution deadline, and reconciles
//! the outcome: matched fills succeed, mismatches are flattened with an
//! immediate opposite market order on the over-filled exchange. Every
//! attempt produces exactly one [`TradeResult`], success or failure.

use crate::risk::RiskManager;
use crate::types::{ArbitrageOpportunity, OpportunityStatus, OpportunityStore};
use async_trait::async_trait;
use chrono::Utc;
use cross_arb_core::{
    Balance, ExchangeClient, ExchangeError, FeeSchedule, Order, Side, TradeExecution, TradeResult,
    TradingPair,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Venue surface orders are routed through.
///
/// The live implementation routes to exchange clients; the paper simulator
/// provides the same surface against internal balances.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    /// Places a market order on the given exchange.
    async fn place_market_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order, ExchangeError>;

    /// Places a limit order on the given exchange.
    async fn place_limit_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, ExchangeError>;

    /// Cancels an order, returning its final state.
    async fn cancel_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        order_id: &str,
    ) -> Result<Order, ExchangeError>;

    /// Fetches an order's current state.
    async fn get_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        order_id: &str,
    ) -> Result<Order, ExchangeError>;

    /// Available balance for a currency on an exchange.
    async fn available_balance(
        &self,
        exchange_id: &str,
        currency: &str,
    ) -> Result<Decimal, ExchangeError>;

    /// Fee schedule for an exchange.
    async fn fee_schedule(&self, exchange_id: &str) -> Result<FeeSchedule, ExchangeError>;
}

/// Routes venue calls to live exchange clients.
pub struct LiveVenue {
    clients: HashMap<String, Arc<dyn ExchangeClient>>,
}

impl LiveVenue {
    /// Creates a venue over the given clients.
    #[must_use]
    pub fn new(clients: Vec<Arc<dyn ExchangeClient>>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|client| (client.exchange_id().to_string(), client))
                .collect(),
        }
    }

    fn client(&self, exchange_id: &str) -> Result<&Arc<dyn ExchangeClient>, ExchangeError> {
        self.clients
            .get(exchange_id)
            .ok_or_else(|| ExchangeError::Config(format!("unknown exchange: {exchange_id}")))
    }
}

#[async_trait]
impl ExecutionVenue for LiveVenue {
    async fn place_market_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order, ExchangeError> {
        self.client(exchange_id)?
            .place_market_order(pair, side, quantity)
            .await
    }

    async fn place_limit_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, ExchangeError> {
        self.client(exchange_id)?
            .place_limit_order(pair, side, price, quantity)
            .await
    }

    async fn cancel_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        order_id: &str,
    ) -> Result<Order, ExchangeError> {
        self.client(exchange_id)?.cancel_order(pair, order_id).await
    }

    async fn get_order(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        order_id: &str,
    ) -> Result<Order, ExchangeError> {
        self.client(exchange_id)?.get_order(pair, order_id).await
    }

    async fn available_balance(
        &self,
        exchange_id: &str,
        currency: &str,
    ) -> Result<Decimal, ExchangeError> {
        let balances: Vec<Balance> = self.client(exchange_id)?.get_balances().await?;
        Ok(balances
            .iter()
            .find(|b| b.currency == currency)
            .map_or(Decimal::ZERO, |b| b.available))
    }

    async fn fee_schedule(&self, exchange_id: &str) -> Result<FeeSchedule, ExchangeError> {
        self.client(exchange_id)?.get_fee_schedule().await
    }
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deadline for the full paired execution.
    pub max_execution_time: Duration,
    /// Place marketable limit orders instead of market orders.
    pub use_marketable_limits: bool,
    /// Price offset from best book for marketable limits, percent.
    pub limit_offset_pct: Decimal,
    /// Order status poll cadence while awaiting terminal state.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_millis(3000),
            use_marketable_limits: false,
            limit_offset_pct: dec!(0.1),
            poll_interval: Duration::from_millis(50),
        }
    }
}

struct LegOutcome {
    exchange_id: String,
    side: Side,
    started_at: Instant,
    result: Result<Order, ExchangeError>,
}

impl LegOutcome {
    fn filled_quantity(&self) -> Decimal {
        self.result
            .as_ref()
            .map_or(Decimal::ZERO, |order| order.filled_quantity)
    }

    fn error_text(&self) -> Option<String> {
        match &self.result {
            Err(e) => Some(e.to_string()),
            Ok(order) if order.filled_quantity == Decimal::ZERO => {
                Some(format!("{} leg ended {:?} with no fill", self.side, order.status))
            }
            Ok(_) => None,
        }
    }
}

/// Executes approved opportunities as paired trades.
pub struct TradeExecutor {
    venue: Arc<dyn ExecutionVenue>,
    store: Arc<dyn OpportunityStore>,
    risk: Arc<RiskManager>,
    config: ExecutorConfig,
}

impl TradeExecutor {
    /// Creates an executor over a venue, store, and risk manager.
    #[must_use]
    pub fn new(
        venue: Arc<dyn ExecutionVenue>,
        store: Arc<dyn OpportunityStore>,
        risk: Arc<RiskManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            venue,
            store,
            risk,
            config,
        }
    }

    /// The planned limit offset, for the risk manager's slippage check.
    #[must_use]
    pub fn planned_limit_offset_pct(&self) -> Option<Decimal> {
        self.config
            .use_marketable_limits
            .then_some(self.config.limit_offset_pct)
    }

    /// Executes one opportunity end to end.
    ///
    /// Reserves a risk slot, runs both legs, reconciles, persists the
    /// opportunity status and the trade result, and releases the slot.
    pub async fn execute(&self, mut opportunity: ArbitrageOpportunity) -> TradeResult {
        let started = Instant::now();
        opportunity.status = OpportunityStatus::Executing;
        self.risk.begin_trade(&opportunity);
        if let Err(e) = self.store.save_opportunity(&opportunity, None).await {
            warn!(error = %e, "Failed to persist executing opportunity");
        }

        let result = self.run(&opportunity, started).await;

        opportunity.status = if result.is_success {
            OpportunityStatus::Executed
        } else {
            OpportunityStatus::Failed
        };
        self.risk.complete_trade(&opportunity, result.profit);

        if let Err(e) = self.store.save_opportunity(&opportunity, None).await {
            warn!(error = %e, "Failed to persist opportunity outcome");
        }
        if let Err(e) = self.store.save_trade(&result).await {
            warn!(error = %e, "Failed to persist trade result");
        }

        info!(
            opportunity_id = %opportunity.id,
            success = result.is_success,
            profit = %result.profit,
            execution_ms = result.execution_time_ms,
            "Execution finished"
        );
        result
    }

    async fn run(&self, opportunity: &ArbitrageOpportunity, started: Instant) -> TradeResult {
        let pair = &opportunity.pair;
        let quantity = opportunity.effective_quantity;

        // Pre-trade balance guard: quote on the buy side, base on the sell
        // side.
        let quote_needed = opportunity.buy_notional();
        match self
            .venue
            .available_balance(&opportunity.buy_exchange, pair.quote())
            .await
        {
            Ok(available) if available < quote_needed => {
                return self.failure(
                    opportunity,
                    started,
                    ExchangeError::insufficient_balance(pair.quote(), quote_needed, available)
                        .to_string(),
                    None,
                    None,
                    Decimal::ZERO,
                );
            }
            Ok(_) => {}
            Err(e) => {
                return self.failure(
                    opportunity,
                    started,
                    format!("balance check failed on {}: {e}", opportunity.buy_exchange),
                    None,
                    None,
                    Decimal::ZERO,
                );
            }
        }
        match self
            .venue
            .available_balance(&opportunity.sell_exchange, pair.base())
            .await
        {
            Ok(available) if available < quantity => {
                return self.failure(
                    opportunity,
                    started,
                    ExchangeError::insufficient_balance(pair.base(), quantity, available)
                        .to_string(),
                    None,
                    None,
                    Decimal::ZERO,
                );
            }
            Ok(_) => {}
            Err(e) => {
                return self.failure(
                    opportunity,
                    started,
                    format!("balance check failed on {}: {e}", opportunity.sell_exchange),
                    None,
                    None,
                    Decimal::ZERO,
                );
            }
        }

        // Both legs issue concurrently; neither waits on the other.
        let buy_limit = self.limit_price(Side::Buy, opportunity.buy_price);
        let sell_limit = self.limit_price(Side::Sell, opportunity.sell_price);
        let (buy, sell) = tokio::join!(
            self.run_leg(&opportunity.buy_exchange, pair, Side::Buy, quantity, buy_limit),
            self.run_leg(&opportunity.sell_exchange, pair, Side::Sell, quantity, sell_limit),
        );

        let skew = if buy.started_at > sell.started_at {
            buy.started_at - sell.started_at
        } else {
            sell.started_at - buy.started_at
        };
        if skew > Duration::from_millis(50) {
            warn!(skew_ms = skew.as_millis() as u64, "Leg start skew above budget");
        }

        self.reconcile(opportunity, started, buy, sell).await
    }

    fn limit_price(&self, side: Side, book_price: Decimal) -> Option<Decimal> {
        if !self.config.use_marketable_limits {
            return None;
        }
        let offset = book_price * self.config.limit_offset_pct / dec!(100);
        Some(match side {
            Side::Buy => book_price + offset,
            Side::Sell => book_price - offset,
        })
    }

    async fn run_leg(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> LegOutcome {
        let started_at = Instant::now();
        let placed = match limit_price {
            Some(price) => {
                self.venue
                    .place_limit_order(exchange_id, pair, side, price, quantity)
                    .await
            }
            None => {
                self.venue
                    .place_market_order(exchange_id, pair, side, quantity)
                    .await
            }
        };

        let result = match placed {
            Ok(order) => self.await_terminal(exchange_id, pair, order).await,
            Err(e) => {
                error!(exchange = %exchange_id, side = %side, error = %e, "Leg placement failed");
                Err(e)
            }
        };

        LegOutcome {
            exchange_id: exchange_id.to_string(),
            side,
            started_at,
            result,
        }
    }

    /// Polls until the order is terminal or the deadline passes, then
    /// cancels. A cancel failure keeps the last known state, which may be
    /// partially filled.
    async fn await_terminal(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        mut order: Order,
    ) -> Result<Order, ExchangeError> {
        let deadline = Instant::now() + self.config.max_execution_time;
        loop {
            if order.status.is_terminal() {
                return Ok(order);
            }
            if Instant::now() >= deadline {
                warn!(exchange = %exchange_id, order_id = %order.id, "Leg deadline, canceling");
                return match self.venue.cancel_order(exchange_id, pair, &order.id).await {
                    Ok(canceled) => Ok(canceled),
                    Err(e) => {
                        warn!(error = %e, "Cancel failed, keeping last known state");
                        Ok(order)
                    }
                };
            }
            sleep(self.config.poll_interval).await;
            if let Ok(latest) = self.venue.get_order(exchange_id, pair, &order.id).await {
                order = latest;
            }
        }
    }

    async fn reconcile(
        &self,
        opportunity: &ArbitrageOpportunity,
        started: Instant,
        buy: LegOutcome,
        sell: LegOutcome,
    ) -> TradeResult {
        let pair = &opportunity.pair;
        let buy_fill = buy.filled_quantity();
        let sell_fill = sell.filled_quantity();

        let mut ledger: Vec<Order> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut success;

        match (buy_fill > Decimal::ZERO, sell_fill > Decimal::ZERO) {
            (true, true) => {
                success = true;
                let reconciled = buy_fill.min(sell_fill);
                // Flatten whichever side over-filled relative to the other.
                if buy_fill > reconciled {
                    let excess = buy_fill - reconciled;
                    if let Err(e) = self
                        .flatten(&buy.exchange_id, pair, Side::Sell, excess, &mut ledger)
                        .await
                    {
                        success = false;
                        errors.push(format!(
                            "residual exposure: {excess} {} unflattened on {}: {e}",
                            pair.base(),
                            buy.exchange_id
                        ));
                    }
                }
                if sell_fill > reconciled {
                    let excess = sell_fill - reconciled;
                    if let Err(e) = self
                        .flatten(&sell.exchange_id, pair, Side::Buy, excess, &mut ledger)
                        .await
                    {
                        success = false;
                        errors.push(format!(
                            "residual short: {excess} {} unflattened on {}: {e}",
                            pair.base(),
                            sell.exchange_id
                        ));
                    }
                }
            }
            (true, false) => {
                success = false;
                if let Some(text) = sell.error_text() {
                    errors.push(text);
                }
                // Flatten the bought quantity to close exposure; the
                // realized loss is the crossing spread.
                if let Err(e) = self
                    .flatten(&buy.exchange_id, pair, Side::Sell, buy_fill, &mut ledger)
                    .await
                {
                    errors.push(format!(
                        "residual exposure: {buy_fill} {} unflattened on {}: {e}",
                        pair.base(),
                        buy.exchange_id
                    ));
                }
            }
            (false, true) => {
                success = false;
                if let Some(text) = buy.error_text() {
                    errors.push(text);
                }
                if let Err(e) = self
                    .flatten(&sell.exchange_id, pair, Side::Buy, sell_fill, &mut ledger)
                    .await
                {
                    errors.push(format!(
                        "residual short: {sell_fill} {} unflattened on {}: {e}",
                        pair.base(),
                        sell.exchange_id
                    ));
                }
            }
            (false, false) => {
                success = false;
                errors.extend(buy.error_text());
                errors.extend(sell.error_text());
            }
        }

        let buy_execution = self.execution_record(opportunity, &buy).await;
        let sell_execution = self.execution_record(opportunity, &sell).await;

        // P&L over every fill, flattening orders included.
        let mut cost = Decimal::ZERO;
        let mut proceeds = Decimal::ZERO;
        let mut fees = Decimal::ZERO;
        let mut all_orders: Vec<&Order> = ledger.iter().collect();
        if let Ok(order) = &buy.result {
            all_orders.push(order);
        }
        if let Ok(order) = &sell.result {
            all_orders.push(order);
        }
        for order in all_orders {
            let Some(notional) = order.fill_notional() else {
                continue;
            };
            let rate = self
                .venue
                .fee_schedule(&order.exchange_id)
                .await
                .map_or(Decimal::ZERO, |schedule| schedule.taker_rate);
            fees += notional * rate;
            match order.side {
                Side::Buy => cost += notional,
                Side::Sell => proceeds += notional,
            }
        }
        let profit = proceeds - cost - fees;
        let profit_pct = if cost > Decimal::ZERO {
            profit / cost * dec!(100)
        } else {
            Decimal::ZERO
        };

        TradeResult {
            id: Uuid::new_v4(),
            opportunity_id: opportunity.id,
            is_success: success,
            buy_execution,
            sell_execution,
            profit,
            profit_pct,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            execution_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    async fn flatten(
        &self,
        exchange_id: &str,
        pair: &TradingPair,
        side: Side,
        quantity: Decimal,
        ledger: &mut Vec<Order>,
    ) -> Result<(), ExchangeError> {
        warn!(
            exchange = %exchange_id,
            side = %side,
            quantity = %quantity,
            "Flattening with opposite market order"
        );
        let order = self
            .venue
            .place_market_order(exchange_id, pair, side, quantity)
            .await?;
        let order = self.await_terminal(exchange_id, pair, order).await?;
        if order.filled_quantity < quantity {
            let residual = quantity - order.filled_quantity;
            ledger.push(order);
            return Err(ExchangeError::OrderRejected(format!(
                "flatten filled short by {residual}"
            )));
        }
        ledger.push(order);
        Ok(())
    }

    async fn execution_record(
        &self,
        opportunity: &ArbitrageOpportunity,
        leg: &LegOutcome,
    ) -> Option<TradeExecution> {
        let order = leg.result.as_ref().ok()?;
        if order.filled_quantity == Decimal::ZERO {
            return None;
        }
        let price = order.avg_fill_price?;
        let notional = price * order.filled_quantity;
        let rate = self
            .venue
            .fee_schedule(&leg.exchange_id)
            .await
            .map_or(Decimal::ZERO, |schedule| schedule.taker_rate);

        Some(TradeExecution {
            trade_id: Uuid::new_v4(),
            exchange_id: leg.exchange_id.clone(),
            pair: opportunity.pair.clone(),
            side: leg.side,
            order_type: order.order_type,
            price,
            quantity: order.filled_quantity,
            fee: notional * rate,
            fee_currency: opportunity.pair.quote().to_string(),
            timestamp: order.last_updated,
            opportunity_id: Some(opportunity.id),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn failure(
        &self,
        opportunity: &ArbitrageOpportunity,
        started: Instant,
        error: String,
        buy_execution: Option<TradeExecution>,
        sell_execution: Option<TradeExecution>,
        profit: Decimal,
    ) -> TradeResult {
        TradeResult {
            id: Uuid::new_v4(),
            opportunity_id: opportunity.id,
            is_success: false,
            buy_execution,
            sell_execution,
            profit,
            profit_pct: Decimal::ZERO,
            error: Some(error),
            execution_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
