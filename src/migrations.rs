//! Versioned, self-healing schema migrations.
//!
//! Every migration carries a probe that inspects the live schema, so the
//! manager can re-run against a partially migrated database and only apply
//! what is actually missing. A failed migration rolls back its transaction
//! and halts the run; the application still starts and reports the
//! unapplied set through the API.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{error, info};

use crate::error::MigrationError;

/// Schema probe deciding whether a migration still needs to run.
#[derive(Debug, Clone)]
pub enum Probe {
    /// Needed when any of the listed tables is absent.
    TablesMissing(&'static [&'static str]),
    /// Needed when the column is absent from the table.
    ColumnMissing {
        table: &'static str,
        column: &'static str,
    },
}

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub probe: Probe,
    pub statements: &'static [&'static str],
}

impl Migration {
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for stmt in self.statements {
            hasher.update(stmt.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub skipped: Vec<i64>,
    pub pending: Vec<i64>,
    pub degraded: bool,
    pub error: Option<String>,
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS c FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await?;
    let count: i64 = row.get("c");
    Ok(count > 0)
}

async fn is_needed(pool: &SqlitePool, probe: &Probe) -> Result<bool, sqlx::Error> {
    match probe {
        Probe::TablesMissing(tables) => {
            for table in *tables {
                if !table_exists(pool, table).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Probe::ColumnMissing { table, column } => {
            if !table_exists(pool, table).await? {
                return Ok(true);
            }
            Ok(!column_exists(pool, table, column).await?)
        }
    }
}

async fn ensure_migrations_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn recorded_versions(pool: &SqlitePool) -> Result<Vec<i64>, sqlx::Error> {
    let rows = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<i64, _>("version")).collect())
}

async fn apply_one(pool: &SqlitePool, migration: &Migration) -> Result<(), MigrationError> {
    let mut tx = pool.begin().await.map_err(MigrationError::Sql)?;
    for stmt in migration.statements {
        sqlx::query(stmt)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::Failed {
                version: migration.version,
                source: e,
            })?;
    }
    sqlx::query(
        "INSERT INTO schema_migrations (version, name, checksum, applied_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(version) DO UPDATE SET checksum = excluded.checksum, applied_at = excluded.applied_at",
    )
    .bind(migration.version)
    .bind(migration.name)
    .bind(migration.checksum())
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(|e| MigrationError::Failed {
        version: migration.version,
        source: e,
    })?;
    tx.commit().await.map_err(MigrationError::Sql)?;
    Ok(())
}

/// Run all pending migrations in version order. Idempotent: already-applied
/// migrations whose probes report a healthy schema are skipped, and partial
/// states (recorded but probe says missing) are healed by re-applying.
pub async fn run_migrations(pool: &SqlitePool) -> Result<MigrationReport, MigrationError> {
    ensure_migrations_table(pool).await?;
    let recorded = recorded_versions(pool).await?;

    let mut report = MigrationReport::default();
    let migrations = all_migrations();

    for (idx, migration) in migrations.iter().enumerate() {
        let needed = is_needed(pool, &migration.probe).await?;
        let on_record = recorded.contains(&migration.version);

        if !needed && on_record {
            report.skipped.push(migration.version);
            continue;
        }
        if !needed && !on_record {
            // Schema is already in shape (e.g. restored backup); just record it.
            apply_record_only(pool, migration).await?;
            report.skipped.push(migration.version);
            continue;
        }

        info!(version = migration.version, name = migration.name, "applying migration");
        match apply_one(pool, migration).await {
            Ok(()) => report.applied.push(migration.version),
            Err(e) => {
                error!(version = migration.version, error = %e, "migration failed, halting manager");
                report.degraded = true;
                report.error = Some(e.to_string());
                report.pending = migrations[idx..].iter().map(|m| m.version).collect();
                return Ok(report);
            }
        }
    }

    if !report.applied.is_empty() {
        info!(count = report.applied.len(), "migrations applied");
    }
    Ok(report)
}

async fn apply_record_only(pool: &SqlitePool, migration: &Migration) -> Result<(), MigrationError> {
    sqlx::query(
        "INSERT INTO schema_migrations (version, name, checksum, applied_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(version) DO NOTHING",
    )
    .bind(migration.version)
    .bind(migration.name)
    .bind(migration.checksum())
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(MigrationError::Sql)?;
    Ok(())
}

pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "core_tables",
            probe: Probe::TablesMissing(&["sources", "articles"]),
            statements: &[
                "CREATE TABLE IF NOT EXISTS sources (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    source_type TEXT NOT NULL,
                    url TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    config TEXT NOT NULL DEFAULT '{}',
                    fetch_interval INTEGER NOT NULL DEFAULT 1800,
                    last_fetch TEXT,
                    last_success TEXT,
                    last_error TEXT,
                    error_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    UNIQUE(name, url)
                )",
                "CREATE TABLE IF NOT EXISTS articles (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    url TEXT NOT NULL UNIQUE,
                    content TEXT,
                    summary TEXT,
                    published_at TEXT NOT NULL,
                    fetched_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    summary_processed INTEGER NOT NULL DEFAULT 0,
                    category_processed INTEGER NOT NULL DEFAULT 0,
                    hash_content TEXT,
                    media_files TEXT NOT NULL DEFAULT '[]'
                )",
                "CREATE INDEX IF NOT EXISTS idx_articles_published_at ON articles(published_at)",
                "CREATE INDEX IF NOT EXISTS idx_articles_hash_content ON articles(hash_content)",
                "CREATE INDEX IF NOT EXISTS idx_articles_source_id ON articles(source_id)",
            ],
        },
        Migration {
            version: 2,
            name: "category_tables",
            probe: Probe::TablesMissing(&["categories", "article_categories", "category_mapping"]),
            statements: &[
                "CREATE TABLE IF NOT EXISTS categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    display_name TEXT NOT NULL,
                    color TEXT NOT NULL DEFAULT '#6c757d',
                    description TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                )",
                "CREATE TABLE IF NOT EXISTS article_categories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                    category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                    confidence REAL NOT NULL DEFAULT 1.0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    UNIQUE(article_id, category_id)
                )",
                "CREATE TABLE IF NOT EXISTS category_mapping (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ai_category TEXT NOT NULL UNIQUE,
                    fixed_category TEXT NOT NULL,
                    confidence_threshold REAL NOT NULL DEFAULT 0,
                    description TEXT,
                    usage_count INTEGER NOT NULL DEFAULT 0,
                    last_used TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                )",
                "CREATE INDEX IF NOT EXISTS idx_article_categories_article ON article_categories(article_id)",
            ],
        },
        Migration {
            version: 3,
            name: "extraction_learning_tables",
            probe: Probe::TablesMissing(&[
                "extraction_patterns",
                "domain_stability",
                "extraction_attempts",
                "ai_usage_tracking",
            ]),
            statements: &[
                "CREATE TABLE IF NOT EXISTS extraction_patterns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    domain TEXT NOT NULL,
                    selector_pattern TEXT NOT NULL,
                    extraction_strategy TEXT NOT NULL,
                    success_count INTEGER NOT NULL DEFAULT 0,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    quality_score_avg REAL NOT NULL DEFAULT 0,
                    discovered_by TEXT NOT NULL DEFAULT 'manual',
                    is_stable INTEGER NOT NULL DEFAULT 0,
                    consecutive_successes INTEGER NOT NULL DEFAULT 0,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    first_success_at TEXT,
                    last_success_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    UNIQUE(domain, selector_pattern, extraction_strategy)
                )",
                "CREATE TABLE IF NOT EXISTS domain_stability (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    domain TEXT NOT NULL UNIQUE,
                    is_stable INTEGER NOT NULL DEFAULT 0,
                    success_rate_7d REAL NOT NULL DEFAULT 0,
                    success_rate_30d REAL NOT NULL DEFAULT 0,
                    total_attempts INTEGER NOT NULL DEFAULT 0,
                    successful_attempts INTEGER NOT NULL DEFAULT 0,
                    consecutive_successes INTEGER NOT NULL DEFAULT 0,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    last_successful_extraction TEXT,
                    last_failed_extraction TEXT,
                    last_ai_analysis TEXT,
                    needs_reanalysis INTEGER NOT NULL DEFAULT 0,
                    needs_render INTEGER NOT NULL DEFAULT 0,
                    render_timeout_ms INTEGER NOT NULL DEFAULT 10000,
                    ai_credits_saved INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                )",
                "CREATE TABLE IF NOT EXISTS extraction_attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    article_url TEXT NOT NULL,
                    domain TEXT NOT NULL,
                    extraction_strategy TEXT NOT NULL,
                    selector_used TEXT,
                    success INTEGER NOT NULL,
                    content_length INTEGER,
                    quality_score REAL,
                    extraction_time_ms INTEGER,
                    error_message TEXT,
                    http_status_code INTEGER,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                )",
                "CREATE INDEX IF NOT EXISTS idx_extraction_attempts_domain ON extraction_attempts(domain, created_at)",
                "CREATE TABLE IF NOT EXISTS ai_usage_tracking (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    domain TEXT NOT NULL,
                    analysis_type TEXT NOT NULL,
                    analysis_result TEXT,
                    patterns_discovered INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                )",
            ],
        },
        Migration {
            version: 4,
            name: "scheduling_tables",
            probe: Probe::TablesMissing(&["schedule_settings", "settings", "task_queue"]),
            statements: &[
                "CREATE TABLE IF NOT EXISTS schedule_settings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_name TEXT NOT NULL UNIQUE,
                    enabled INTEGER NOT NULL DEFAULT 0,
                    schedule_type TEXT NOT NULL DEFAULT 'daily',
                    hour INTEGER NOT NULL DEFAULT 9,
                    minute INTEGER NOT NULL DEFAULT 0,
                    weekdays TEXT NOT NULL DEFAULT '[]',
                    timezone TEXT NOT NULL DEFAULT 'Europe/Belgrade',
                    last_run TEXT,
                    next_run TEXT,
                    is_running INTEGER NOT NULL DEFAULT 0,
                    task_config TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                )",
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                )",
                "CREATE TABLE IF NOT EXISTS task_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_type TEXT NOT NULL,
                    task_data TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 3,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    started_at TEXT,
                    completed_at TEXT,
                    error_message TEXT
                )",
            ],
        },
        Migration {
            version: 5,
            name: "summary_and_stats_tables",
            probe: Probe::TablesMissing(&["daily_summaries", "processing_stats"]),
            statements: &[
                "CREATE TABLE IF NOT EXISTS daily_summaries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    date TEXT NOT NULL,
                    category TEXT NOT NULL,
                    summary_text TEXT NOT NULL,
                    articles_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                    UNIQUE(date, category)
                )",
                "CREATE TABLE IF NOT EXISTS processing_stats (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    date TEXT NOT NULL UNIQUE,
                    articles_fetched INTEGER NOT NULL DEFAULT 0,
                    articles_processed INTEGER NOT NULL DEFAULT 0,
                    api_calls_made INTEGER NOT NULL DEFAULT 0,
                    errors_count INTEGER NOT NULL DEFAULT 0,
                    processing_time_seconds INTEGER NOT NULL DEFAULT 0
                )",
            ],
        },
        Migration {
            version: 6,
            name: "article_ad_and_title_columns",
            probe: Probe::ColumnMissing {
                table: "articles",
                column: "ad_processed",
            },
            statements: &[
                "ALTER TABLE articles ADD COLUMN optimized_title TEXT",
                "ALTER TABLE articles ADD COLUMN ad_processed INTEGER NOT NULL DEFAULT 0",
                "ALTER TABLE articles ADD COLUMN is_advertisement INTEGER NOT NULL DEFAULT 0",
                "ALTER TABLE articles ADD COLUMN ad_confidence REAL NOT NULL DEFAULT 0",
                "ALTER TABLE articles ADD COLUMN ad_type TEXT",
                "ALTER TABLE articles ADD COLUMN ad_reasoning TEXT",
                "ALTER TABLE articles ADD COLUMN ad_markers TEXT NOT NULL DEFAULT '[]'",
                "CREATE INDEX IF NOT EXISTS idx_articles_is_advertisement ON articles(is_advertisement)",
            ],
        },
        Migration {
            version: 7,
            name: "domain_render_budget_columns",
            probe: Probe::ColumnMissing {
                table: "domain_stability",
                column: "render_failure_count",
            },
            statements: &[
                "ALTER TABLE domain_stability ADD COLUMN render_failure_count INTEGER NOT NULL DEFAULT 0",
                "ALTER TABLE domain_stability ADD COLUMN last_render_failure_at TEXT",
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn fresh_database_applies_all_migrations() {
        let pool = create_test_pool().await.unwrap();
        let report = run_migrations(&pool).await.unwrap();
        assert!(!report.degraded);
        assert_eq!(report.applied.len(), all_migrations().len());

        for table in [
            "sources",
            "articles",
            "categories",
            "article_categories",
            "category_mapping",
            "extraction_patterns",
            "domain_stability",
            "extraction_attempts",
            "ai_usage_tracking",
            "schedule_settings",
            "settings",
            "task_queue",
            "daily_summaries",
            "processing_stats",
            "schema_migrations",
        ] {
            assert!(table_exists(&pool, table).await.unwrap(), "missing table {table}");
        }
        assert!(column_exists(&pool, "articles", "ad_markers").await.unwrap());
        assert!(
            column_exists(&pool, "domain_stability", "render_failure_count")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn rerun_is_a_noop() {
        let pool = create_test_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let second = run_migrations(&pool).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped.len(), all_migrations().len());
        assert!(!second.degraded);
    }

    #[tokio::test]
    async fn heals_partial_schema() {
        let pool = create_test_pool().await.unwrap();
        // Simulate an old install that only has the first migration's tables.
        for stmt in all_migrations()[0].statements {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        let report = run_migrations(&pool).await.unwrap();
        assert!(!report.degraded);
        // v1 is detected as healthy and only recorded; the rest are applied.
        assert!(report.applied.contains(&2));
        assert!(report.applied.contains(&6));
        assert!(table_exists(&pool, "category_mapping").await.unwrap());
        assert!(table_exists(&pool, "domain_stability").await.unwrap());

        let versions = recorded_versions(&pool).await.unwrap();
        assert_eq!(versions, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn versions_are_monotonic() {
        let migrations = all_migrations();
        for pair in migrations.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}
