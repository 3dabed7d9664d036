use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// How long startup waits for the database before giving up.
const CONNECT_DEADLINE: Duration = Duration::from_secs(30);

pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database URL '{database_url}'"))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    // Ensure the parent directory exists for file-backed databases
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating data directory: {}", parent.display()))?;
                }
            }
        }
    }

    let pool = tokio::time::timeout(
        CONNECT_DEADLINE,
        SqlitePoolOptions::new().max_connections(8).connect_with(options),
    )
    .await
    .context("database connection deadline exceeded")?
    .with_context(|| format!("connecting to database: {database_url}"))?;

    info!(url = %database_url, "database connected (WAL mode, foreign keys enabled)");

    Ok(pool)
}

/// In-memory pool for tests; single connection so every query sees the
/// same database.
pub async fn create_test_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}
