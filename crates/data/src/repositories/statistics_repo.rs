//! Statistics repository.
//!
//! Rolling statistics are computed with SQL aggregates over the live
//! collections and optionally materialized into the `statistics` table by
//! the housekeeping task.

use crate::models::StatisticsRecord;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

/// Repository for computed and materialized statistics.
#[derive(Debug, Clone)]
pub struct StatisticsRepository {
    pool: PgPool,
}

impl StatisticsRepository {
    /// Creates a repository over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Computes statistics over a window, optionally filtered by pair.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn compute(
        &self,
        pair: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<StatisticsRecord> {
        let (detected, missed, avg_spread): (i64, i64, Option<Decimal>) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = 'missed'),
                   AVG(spread_pct)
            FROM opportunities
            WHERE detected_at >= $1 AND detected_at <= $2
              AND ($3::text IS NULL OR pair = $3)
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(pair)
        .fetch_one(&self.pool)
        .await?;

        let (executed, succeeded, total_profit): (i64, i64, Option<Decimal>) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE is_success),
                   SUM(profit)
            FROM trades
            WHERE executed_at >= $1 AND executed_at <= $2
              AND ($3::text IS NULL OR pair = $3)
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(pair)
        .fetch_one(&self.pool)
        .await?;

        Ok(StatisticsRecord {
            pair: pair.map(String::from),
            window_start: start,
            window_end: end,
            opportunities_detected: detected,
            opportunities_missed: missed,
            trades_executed: executed,
            trades_succeeded: succeeded,
            total_profit: total_profit.unwrap_or(Decimal::ZERO),
            avg_spread_pct: avg_spread,
        })
    }

    /// Materializes a computed window into the `statistics` table.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn save_rollup(&self, record: &StatisticsRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO statistics
                (pair, window_start, window_end, opportunities_detected,
                 opportunities_missed, trades_executed, trades_succeeded,
                 total_profit, avg_spread_pct)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.pair)
        .bind(record.window_start)
        .bind(record.window_end)
        .bind(record.opportunities_detected)
        .bind(record.opportunities_missed)
        .bind(record.trades_executed)
        .bind(record.trades_succeeded)
        .bind(record.total_profit)
        .bind(record.avg_spread_pct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Materialized windows ending inside a range, newest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn get_range(
        &self,
        pair: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StatisticsRecord>> {
        let records = sqlx::query_as::<_, StatisticsRecord>(
            r#"
            SELECT pair, window_start, window_end, opportunities_detected,
                   opportunities_missed, trades_executed, trades_succeeded,
                   total_profit, avg_spread_pct
            FROM statistics
            WHERE window_end >= $1 AND window_end <= $2
              AND ($3::text IS NULL OR pair = $3)
            ORDER BY window_end DESC
            LIMIT $4
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(pair)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Deletes materialized windows ending before the cutoff.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM statistics WHERE window_end < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
