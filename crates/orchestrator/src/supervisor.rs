//! The engine supervisor actor.
//!
//! Owns the process-wide lifecycle: start wires clients → aggregator →
//! detector/risk → executor in order, stop tears them down in reverse with
//! a drain grace of `max_execution_time_ms`. A dead detector task is
//! restarted with exponential backoff; repeated deaths open a circuit
//! breaker that suspends restarts for its cooldown.

use crate::commands::{EngineCommand, EngineState, EngineStatus, ExchangeStatus};
use crate::handle::EngineHandle;
use cross_arb_core::{
    AppConfig, BackoffPolicy, CircuitBreaker, ExchangeClient, FeeSchedule, TradingPair,
};
use cross_arb_data::{run_compaction, StatisticsRepository};
use cross_arb_engine::{
    AggregatorConfig, DetectionPipeline, DetectorConfig, ExecutionVenue, ExecutorConfig,
    LiveVenue, MarketDataAggregator, OpportunityDetector, OpportunityStore, PaperVenue,
    PaperVenueConfig, PipelineConfig, RiskManager, TradeExecutor,
};
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Cadence of the supervisor's monitor/status tick.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of TTL compaction and statistics rollups.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

struct Running {
    aggregator: Arc<MarketDataAggregator>,
    pipeline: Option<DetectionPipeline>,
    detector: Arc<RwLock<OpportunityDetector>>,
    risk: Arc<RiskManager>,
    executor: Arc<TradeExecutor>,
    housekeeping: Option<JoinHandle<()>>,
    paper: bool,
    next_restart_at: Option<Instant>,
}

/// Supervisor actor for the whole engine.
pub struct Supervisor {
    config: AppConfig,
    clients: Vec<Arc<dyn ExchangeClient>>,
    store: Arc<dyn OpportunityStore>,
    pool: Option<PgPool>,
    command_rx: mpsc::Receiver<EngineCommand>,
    status_tx: watch::Sender<EngineStatus>,
    running: Option<Running>,
    restart_backoff: BackoffPolicy,
    restart_breaker: CircuitBreaker,
    restart_attempts: u32,
    restarts_total: u32,
}

impl Supervisor {
    /// Spawns the actor and returns the control handle.
    ///
    /// `pool` enables the housekeeping task (TTL compaction and hourly
    /// statistics rollups); pass `None` in paper setups without a database.
    #[must_use]
    pub fn spawn(
        config: AppConfig,
        clients: Vec<Arc<dyn ExchangeClient>>,
        store: Arc<dyn OpportunityStore>,
        pool: Option<PgPool>,
    ) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(EngineStatus::stopped());

        let supervisor = Self {
            config,
            clients,
            store,
            pool,
            command_rx,
            status_tx,
            running: None,
            restart_backoff: BackoffPolicy::default(),
            restart_breaker: CircuitBreaker::new(Duration::from_secs(300)),
            restart_attempts: 0,
            restarts_total: 0,
        };
        tokio::spawn(supervisor.run());

        EngineHandle {
            command_tx,
            status_rx,
        }
    }

    async fn run(mut self) {
        info!("Supervisor running");
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(EngineCommand::Start { respond_to }) => {
                            let _ = respond_to.send(self.handle_start().await);
                        }
                        Some(EngineCommand::Stop { respond_to }) => {
                            let _ = respond_to.send(self.handle_stop().await);
                        }
                        Some(EngineCommand::GetStatus { respond_to }) => {
                            let _ = respond_to.send(self.snapshot());
                        }
                        Some(EngineCommand::UpdateConfig { config, respond_to }) => {
                            let _ = respond_to.send(self.handle_update(*config));
                        }
                        Some(EngineCommand::Shutdown) | None => {
                            let _ = self.handle_stop().await;
                            break;
                        }
                    }
                    self.publish_status();
                }
                _ = tick.tick() => {
                    self.monitor().await;
                    self.publish_status();
                }
            }
        }
        info!("Supervisor stopped");
    }

    async fn handle_start(&mut self) -> anyhow::Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        if !self.config.is_enabled {
            anyhow::bail!("detection is disabled by configuration");
        }
        self.config.validate()?;
        info!(
            paper = self.config.paper_trading_enabled,
            pairs = self.config.trading_pairs.len(),
            "Starting engine"
        );

        // Credentials first: auth failures must surface before anything
        // streams.
        for client in &self.clients {
            let Some(exchange) = self
                .config
                .exchanges
                .iter()
                .find(|e| e.exchange_id == client.exchange_id())
            else {
                continue;
            };
            if !exchange.api_key.is_empty() {
                client.authenticate(exchange.credentials()).await?;
            }
        }

        let fees = self.collect_fees().await;

        let aggregator = Arc::new(MarketDataAggregator::new(AggregatorConfig::default()));
        aggregator
            .start(&self.clients, &self.config.trading_pairs)
            .await?;

        let venue: Arc<dyn ExecutionVenue> = if self.config.paper_trading_enabled {
            Arc::new(PaperVenue::new(
                Arc::clone(&aggregator),
                PaperVenueConfig {
                    fees: fees.clone(),
                    ..PaperVenueConfig::default()
                },
            ))
        } else {
            Arc::new(LiveVenue::new(self.clients.clone()))
        };

        let equity = self.estimate_equity(venue.as_ref()).await;
        info!(equity = %equity, "Risk equity estimated");
        let risk = Arc::new(RiskManager::new(self.config.risk_profile.clone(), equity));

        let detector = Arc::new(RwLock::new(
            OpportunityDetector::new(self.detector_config(equity)).with_fees(fees),
        ));
        let executor = Arc::new(TradeExecutor::new(
            Arc::clone(&venue),
            Arc::clone(&self.store),
            Arc::clone(&risk),
            ExecutorConfig {
                max_execution_time: Duration::from_millis(self.config.max_execution_time_ms),
                ..ExecutorConfig::default()
            },
        ));

        let pipeline = DetectionPipeline::spawn(
            &aggregator,
            Arc::clone(&detector),
            Arc::clone(&risk),
            Arc::clone(&executor),
            Arc::clone(&self.store),
            self.pipeline_config(),
        );

        let housekeeping = self.pool.clone().map(|pool| {
            tokio::spawn(run_housekeeping(pool, self.config.trading_pairs.clone()))
        });

        self.running = Some(Running {
            aggregator,
            pipeline: Some(pipeline),
            detector,
            risk,
            executor,
            housekeeping,
            paper: self.config.paper_trading_enabled,
            next_restart_at: None,
        });
        self.restart_attempts = 0;
        self.restart_breaker.reset();
        Ok(())
    }

    async fn handle_stop(&mut self) -> anyhow::Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!("Stopping engine");

        // Reverse of start: executor/detector drain first, then the
        // aggregator, then the subscriptions.
        if let Some(pipeline) = running.pipeline {
            pipeline
                .stop(Duration::from_millis(self.config.max_execution_time_ms))
                .await;
        }
        running.aggregator.stop().await;
        for client in &self.clients {
            for pair in &self.config.trading_pairs {
                if let Err(e) = client.unsubscribe_order_book(pair).await {
                    warn!(exchange = client.exchange_id(), error = %e, "Unsubscribe failed");
                }
            }
        }
        if let Some(housekeeping) = running.housekeeping {
            housekeeping.abort();
        }
        Ok(())
    }

    fn handle_update(&mut self, config: AppConfig) -> anyhow::Result<()> {
        config.validate()?;
        if let Some(running) = &self.running {
            running.risk.set_profile(config.risk_profile.clone());
            // Thresholds change; the capital cap derived at start is kept.
            let mut detector_config = self.detector_config_for(&config);
            detector_config.capital_cap_quote =
                running.detector.read().config().capital_cap_quote;
            running.detector.write().set_config(detector_config);
        }
        info!("Configuration replaced");
        self.config = config;
        Ok(())
    }

    /// Restarts the pipeline when its detector task has died, under the
    /// backoff/breaker policy.
    async fn monitor(&mut self) {
        let pipeline_config = self.pipeline_config();
        let Some(running) = &mut self.running else {
            return;
        };

        let dead = running
            .pipeline
            .as_ref()
            .is_some_and(DetectionPipeline::detector_finished);
        if dead {
            error!("Detector task died unexpectedly");
            if let Some(pipeline) = running.pipeline.take() {
                pipeline.stop(Duration::from_millis(100)).await;
            }
            self.restart_attempts += 1;
            if self.restart_attempts >= self.restart_backoff.max_attempts {
                warn!("Repeated pipeline failures, opening restart breaker");
                self.restart_breaker.trip();
                running.next_restart_at = None;
            } else {
                let delay = self.restart_backoff.delay_for(self.restart_attempts - 1);
                running.next_restart_at = Some(Instant::now() + delay);
            }
            return;
        }

        if running.pipeline.is_none() {
            if self.restart_breaker.is_open() {
                return;
            }
            let due = match running.next_restart_at {
                Some(at) => Instant::now() >= at,
                // Breaker just closed: restart now and start counting fresh.
                None => {
                    self.restart_attempts = 0;
                    true
                }
            };
            if due {
                info!(restarts = self.restarts_total + 1, "Restarting pipeline");
                let pipeline = DetectionPipeline::spawn(
                    &running.aggregator,
                    Arc::clone(&running.detector),
                    Arc::clone(&running.risk),
                    Arc::clone(&running.executor),
                    Arc::clone(&self.store),
                    pipeline_config,
                );
                running.pipeline = Some(pipeline);
                running.next_restart_at = None;
                self.restarts_total += 1;
            }
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            auto_execute: self.config.auto_execute_trades,
            max_concurrent_executions: self.config.max_concurrent_arbitrage_operations,
        }
    }

    fn detector_config(&self, equity: Decimal) -> DetectorConfig {
        let mut config = self.detector_config_for(&self.config);
        config.capital_cap_quote = Some(
            self.config.risk_profile.max_capital_per_trade_pct / Decimal::ONE_HUNDRED * equity,
        );
        config
    }

    fn detector_config_for(&self, config: &AppConfig) -> DetectorConfig {
        DetectorConfig {
            min_profit_pct: config.minimum_profit_percentage,
            min_trade_quantity: config.min_trade_quantity,
            capital_cap_quote: None,
            expected_tick_interval_ms: config.expected_tick_interval_ms,
        }
    }

    async fn collect_fees(&self) -> Vec<FeeSchedule> {
        let mut fees = Vec::new();
        for client in &self.clients {
            match client.get_fee_schedule().await {
                Ok(schedule) => fees.push(schedule),
                Err(e) => {
                    warn!(
                        exchange = client.exchange_id(),
                        error = %e,
                        "Fee schedule unavailable, assuming zero fees"
                    );
                    fees.push(FeeSchedule::new(
                        client.exchange_id(),
                        Decimal::ZERO,
                        Decimal::ZERO,
                    ));
                }
            }
        }
        fees
    }

    /// Equity estimate: available quote balances summed across exchanges.
    async fn estimate_equity(&self, venue: &dyn ExecutionVenue) -> Decimal {
        let quotes: HashSet<&str> = self
            .config
            .trading_pairs
            .iter()
            .map(TradingPair::quote)
            .collect();
        let mut equity = Decimal::ZERO;
        for client in &self.clients {
            for quote in &quotes {
                match venue.available_balance(client.exchange_id(), quote).await {
                    Ok(balance) => equity += balance,
                    Err(e) => {
                        warn!(
                            exchange = client.exchange_id(),
                            currency = quote,
                            error = %e,
                            "Balance unavailable for equity estimate"
                        );
                    }
                }
            }
        }
        equity
    }

    fn snapshot(&self) -> EngineStatus {
        let exchanges = self
            .clients
            .iter()
            .map(|client| {
                let health = client.health();
                ExchangeStatus {
                    exchange_id: client.exchange_id().to_string(),
                    connected: health.connected,
                    breaker_open: health.breaker_open,
                    healthy: health.is_healthy(Duration::from_secs(120)),
                    last_error: health.last_error.clone(),
                    messages_in: health.messages_in,
                    messages_out: health.messages_out,
                    reconnect_attempts: health.reconnect_attempts,
                }
            })
            .collect();

        match &self.running {
            Some(running) => EngineStatus {
                state: if self.restart_breaker.is_open() {
                    EngineState::CircuitOpen
                } else {
                    EngineState::Running
                },
                paper_trading: running.paper,
                open_trades: running.risk.open_trades(),
                realized_pnl_today: running.risk.realized_pnl_today(),
                exchanges,
                dropped_opportunities: running
                    .pipeline
                    .as_ref()
                    .map_or(0, DetectionPipeline::dropped_opportunities),
                stale_books_dropped: running.aggregator.stale_dropped(),
                pipeline_restarts: self.restarts_total,
            },
            None => EngineStatus {
                exchanges,
                ..EngineStatus::stopped()
            },
        }
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(self.snapshot());
    }
}

/// Hourly TTL compaction plus statistics rollups.
async fn run_housekeeping(pool: PgPool, pairs: Vec<TradingPair>) {
    let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let statistics = StatisticsRepository::new(pool.clone());

    loop {
        tick.tick().await;
        if let Err(e) = run_compaction(&pool).await {
            warn!(error = %e, "Compaction pass failed");
        }

        let end = Utc::now();
        let start = end - chrono::Duration::hours(1);
        // Whole-book rollup plus one per pair.
        match statistics.compute(None, start, end).await {
            Ok(record) => {
                if let Err(e) = statistics.save_rollup(&record).await {
                    warn!(error = %e, "Rollup save failed");
                }
            }
            Err(e) => warn!(error = %e, "Rollup compute failed"),
        }
        for pair in &pairs {
            let name = pair.to_string();
            match statistics.compute(Some(&name), start, end).await {
                Ok(record) => {
                    if let Err(e) = statistics.save_rollup(&record).await {
                        warn!(pair = %name, error = %e, "Pair rollup save failed");
                    }
                }
                Err(e) => warn!(pair = %name, error = %e, "Pair rollup compute failed"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
