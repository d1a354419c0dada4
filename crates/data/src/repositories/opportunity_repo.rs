//! Opportunity repository.
//!
//! Writes are idempotent by opportunity id; a second save with the same id
//! updates the status and miss reason in place.

use crate::models::OpportunityRecord;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Repository for the `opportunities` collection.
#[derive(Debug, Clone)]
pub struct OpportunityRepository {
    pool: PgPool,
}

impl OpportunityRepository {
    /// Creates a repository over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or updates an opportunity by id.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn save(&self, record: &OpportunityRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO opportunities
                (id, pair, buy_exchange, sell_exchange, buy_price, sell_price,
                 effective_quantity, spread_abs, spread_pct, est_profit_quote,
                 est_fees_quote, detected_at, status, miss_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                miss_reason = EXCLUDED.miss_reason
            "#,
        )
        .bind(record.id)
        .bind(&record.pair)
        .bind(&record.buy_exchange)
        .bind(&record.sell_exchange)
        .bind(record.buy_price)
        .bind(record.sell_price)
        .bind(record.effective_quantity)
        .bind(record.spread_abs)
        .bind(record.spread_pct)
        .bind(record.est_profit_quote)
        .bind(record.est_fees_quote)
        .bind(record.detected_at)
        .bind(&record.status)
        .bind(&record.miss_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches one opportunity by id.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<OpportunityRecord>> {
        let record = sqlx::query_as::<_, OpportunityRecord>(
            r#"
            SELECT id, pair, buy_exchange, sell_exchange, buy_price, sell_price,
                   effective_quantity, spread_abs, spread_pct, est_profit_quote,
                   est_fees_quote, detected_at, status, miss_reason
            FROM opportunities
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Queries opportunities in a time range, newest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn get_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OpportunityRecord>> {
        let records = sqlx::query_as::<_, OpportunityRecord>(
            r#"
            SELECT id, pair, buy_exchange, sell_exchange, buy_price, sell_price,
                   effective_quantity, spread_abs, spread_pct, est_profit_quote,
                   est_fees_quote, detected_at, status, miss_reason
            FROM opportunities
            WHERE detected_at >= $1 AND detected_at <= $2
            ORDER BY detected_at DESC
            LIMIT $3
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Deletes opportunities detected before the cutoff; returns the count.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM opportunities WHERE detected_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cross_arb_engine::{ArbitrageOpportunity, OpportunityStatus};
    use cross_arb_core::TradingPair;
    use rust_decimal_macros::dec;

    async fn repo() -> Option<OpportunityRepository> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let client = crate::database::DatabaseClient::new(&url, 2).await.ok()?;
        Some(OpportunityRepository::new(client.pool()))
    }

    fn record() -> OpportunityRecord {
        let opportunity = ArbitrageOpportunity {
            id: uuid::Uuid::new_v4(),
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
        };
        OpportunityRecord::from_domain(&opportunity, None)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_save_is_idempotent_and_round_trips() {
        let Some(repo) = repo().await else { return };
        let record = record();

        repo.save(&record).await.unwrap();
        repo.save(&record).await.unwrap();

        let fetched = repo.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.buy_price, record.buy_price);
        assert_eq!(fetched.est_profit_quote, record.est_profit_quote);

        let restored = fetched.into_domain().unwrap();
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.status, OpportunityStatus::Detected);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_status_update_on_resave() {
        let Some(repo) = repo().await else { return };
        let mut record = record();
        repo.save(&record).await.unwrap();

        record.status = "missed".to_string();
        record.miss_reason = Some("max_concurrent_trades".to_string());
        repo.save(&record).await.unwrap();

        let fetched = repo.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, "missed");
        assert_eq!(fetched.miss_reason.as_deref(), Some("max_concurrent_trades"));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_range_query_ordered_descending() {
        let Some(repo) = repo().await else { return };
        let record = record();
        repo.save(&record).await.unwrap();

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        let records = repo.get_range(start, end, 100).await.unwrap();
        assert!(!records.is_empty());
        for window in records.windows(2) {
            assert!(window[0].detected_at >= window[1].detected_at);
        }
    }
}
