//! Shared database types and utilities.
//!
//! Provides `DatabaseError`, `unix_timestamp()` and pool creation helpers
//! used by the service storage layer.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::config::DatabaseConfig;

/// Timeout for establishing the pool.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single health-check ping.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Database errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_check_violation() => {
                Self::Validation(db.message().to_string())
            }
            _ => Self::Query(e.to_string()),
        }
    }
}

/// Open (or create) a `SQLite` connection pool described by `config`.
///
/// Creates the parent directory if it does not exist, enables WAL journal
/// mode and foreign keys, and applies the pool tuning knobs. Fails with
/// [`DatabaseError::Connection`] if the pool is not ready within
/// [`CONNECT_TIMEOUT`].
pub async fn open_pool(config: &DatabaseConfig) -> Result<Pool<Sqlite>, DatabaseError> {
    let path = &config.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let connect = SqlitePoolOptions::new()
        .max_connections(config.max_open_conns)
        .min_connections(config.max_idle_conns)
        .max_lifetime(Duration::from_secs(config.conn_max_lifetime))
        .idle_timeout(Duration::from_secs(config.conn_max_idle_time))
        .acquire_timeout(CONNECT_TIMEOUT)
        .connect_with(options);

    let pool = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| DatabaseError::Connection("timed out connecting to database".into()))?
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!(
        path = %path.display(),
        max_open_conns = config.max_open_conns,
        max_idle_conns = config.max_idle_conns,
        "Database opened"
    );

    Ok(pool)
}

/// Open an in-memory `SQLite` connection pool (for testing).
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    Ok(pool)
}

/// Returns the current time as a Unix timestamp (seconds since epoch).
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
