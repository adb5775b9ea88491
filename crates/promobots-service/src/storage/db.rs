//! SQLite database handle for the promobots service.

use promobots_core::config::DatabaseConfig;
use promobots_core::db::{HEALTH_CHECK_TIMEOUT, open_pool, open_pool_in_memory};
use sqlx::{Pool, Sqlite};
use tracing::info;

pub use promobots_core::db::DatabaseError;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open the database described by `config` and apply pending migrations.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = open_pool(config).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let pool = open_pool_in_memory().await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Database migrations complete");
        Ok(())
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Round-trip a trivial query, bounded by [`HEALTH_CHECK_TIMEOUT`].
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        tokio::time::timeout(
            HEALTH_CHECK_TIMEOUT,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| DatabaseError::Connection("health check timed out".into()))??;
        Ok(())
    }

    /// Close the pool. Safe to call more than once.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
