use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Retention windows for TTL-driven compaction.
pub mod retention {
    use chrono::Duration;

    /// Opportunities are kept for 30 days.
    #[must_use]
    pub fn opportunities() -> Duration {
        Duration::days(30)
    }

    /// Trades are kept for one year.
    #[must_use]
    pub fn trades() -> Duration {
        Duration::days(365)
    }

    /// Statistics are kept for two years.
    #[must_use]
    pub fn statistics() -> Duration {
        Duration::days(730)
    }
}

pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    /// Connects to PostgreSQL and runs pending migrations.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established or a
    /// migration fails.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared by the repositories.
    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}
