//! Trade repository.
//!
//! Saves are idempotent by trade id; a duplicate save is a no-op so retried
//! writes never produce duplicate rows.

use crate::models::TradeRecord;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Repository for the `trades` collection.
#[derive(Debug, Clone)]
pub struct TradeRepository {
    pool: PgPool,
}

impl TradeRepository {
    /// Creates a repository over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a trade; a second insert with the same id is a no-op.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn save(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades
                (id, opportunity_id, pair, is_success, profit, profit_pct, error,
                 execution_time_ms,
                 buy_exchange, buy_price, buy_quantity, buy_fee,
                 sell_exchange, sell_price, sell_quantity, sell_fee,
                 executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.opportunity_id)
        .bind(&record.pair)
        .bind(record.is_success)
        .bind(record.profit)
        .bind(record.profit_pct)
        .bind(&record.error)
        .bind(record.execution_time_ms)
        .bind(&record.buy_exchange)
        .bind(record.buy_price)
        .bind(record.buy_quantity)
        .bind(record.buy_fee)
        .bind(&record.sell_exchange)
        .bind(record.sell_price)
        .bind(record.sell_quantity)
        .bind(record.sell_fee)
        .bind(record.executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queries trades in a time range, newest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn get_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TradeRecord>> {
        let records = sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT id, opportunity_id, pair, is_success, profit, profit_pct, error,
                   execution_time_ms,
                   buy_exchange, buy_price, buy_quantity, buy_fee,
                   sell_exchange, sell_price, sell_quantity, sell_fee,
                   executed_at
            FROM trades
            WHERE executed_at >= $1 AND executed_at <= $2
            ORDER BY executed_at DESC
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

    /// All trades linked to an opportunity.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn get_by_opportunity(&self, opportunity_id: Uuid) -> Result<Vec<TradeRecord>> {
        let records = sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT id, opportunity_id, pair, is_success, profit, profit_pct, error,
                   execution_time_ms,
                   buy_exchange, buy_price, buy_quantity, buy_fee,
                   sell_exchange, sell_price, sell_quantity, sell_fee,
                   executed_at
            FROM trades
            WHERE opportunity_id = $1
            ORDER BY executed_at DESC
            "#,
        )
        .bind(opportunity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Deletes trades executed before the cutoff; returns the count.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM trades WHERE executed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
