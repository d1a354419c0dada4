//! PostgreSQL persistence for the arbitrage engine.
//!
//! Repositories share one pool; [`PgStore`] adapts them to the engine's
//! [`OpportunityStore`] surface and [`BufferedStore`] wraps that with
//! write-behind buffering for repository outages. TTL compaction runs
//! through [`run_compaction`] on the housekeeping cadence.

pub mod buffer;
pub mod database;
pub mod models;
pub mod repositories;

pub use buffer::{BufferedPgStore, BufferedStore};
pub use database::{retention, DatabaseClient};
pub use models::{OpportunityRecord, StatisticsRecord, TradeRecord};
pub use repositories::{OpportunityRepository, StatisticsRepository, TradeRepository};

use async_trait::async_trait;
use chrono::Utc;
use cross_arb_core::TradeResult;
use cross_arb_engine::{ArbitrageOpportunity, OpportunityStore};
use sqlx::PgPool;
use tracing::info;

/// Direct (unbuffered) store over the PostgreSQL repositories.
#[derive(Debug, Clone)]
pub struct PgStore {
    opportunities: OpportunityRepository,
    trades: TradeRepository,
}

impl PgStore {
    /// Creates the store over a shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            opportunities: OpportunityRepository::new(pool.clone()),
            trades: TradeRepository::new(pool),
        }
    }

    /// The opportunity repository, for query surfaces.
    #[must_use]
    pub fn opportunities(&self) -> &OpportunityRepository {
        &self.opportunities
    }

    /// The trade repository, for query surfaces.
    #[must_use]
    pub fn trades(&self) -> &TradeRepository {
        &self.trades
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn save_opportunity(
        &self,
        opportunity: &ArbitrageOpportunity,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let record = OpportunityRecord::from_domain(opportunity, reason);
        self.opportunities.save(&record).await
    }

    async fn save_trade(&self, trade: &TradeResult) -> anyhow::Result<()> {
        let record = TradeRecord::from_domain(trade);
        self.trades.save(&record).await
    }
}

/// Runs one TTL compaction pass over all collections.
///
/// # Errors
/// Returns the first repository error encountered.
pub async fn run_compaction(pool: &PgPool) -> anyhow::Result<()> {
    let now = Utc::now();
    let opportunities = OpportunityRepository::new(pool.clone())
        .delete_older_than(now - retention::opportunities())
        .await?;
    let trades = TradeRepository::new(pool.clone())
        .delete_older_than(now - retention::trades())
        .await?;
    let statistics = StatisticsRepository::new(pool.clone())
        .delete_older_than(now - retention::statistics())
        .await?;
    info!(opportunities, trades, statistics, "Compaction pass complete");
    Ok(())
}
