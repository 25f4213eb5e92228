//! # Database Connection Pool Management

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::config::DatabaseConfig;
use crate::errors::{EngineError, Result};

/// Type alias for the database connection pool
pub type DbPool = Pool<Sqlite>;

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a SQLite pool and run embedded migrations.
///
/// In-memory databases are private to a connection, so they get a single
/// connection that is never recycled.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool> {
    if config.max_connections == 0 {
        return Err(EngineError::validation("max_connections must be greater than 0"));
    }

    let mut connect_options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| {
            EngineError::database(e, format!("Invalid SQLite connection string: {}", config.url))
        })?
        .create_if_missing(true)
        .busy_timeout(SQLITE_BUSY_TIMEOUT);

    let pool_options = if config.is_memory() {
        SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new().max_connections(config.max_connections)
    };

    let pool = pool_options
        .acquire_timeout(config.connect_timeout())
        .connect_with(connect_options)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, url = %config.url, "Failed to create SQLite pool");
            EngineError::database(e, format!("Failed to connect to database: {}", config.url))
        })?;

    tracing::info!(
        url = %config.url,
        max_connections = config.max_connections,
        in_memory = config.is_memory(),
        "Database connection pool created"
    );

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply embedded migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("Database migrations applied");
    Ok(())
}

/// Check database connectivity
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| EngineError::database(e, "Database connectivity check failed"))?;
    Ok(())
}
