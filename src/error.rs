use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Outbound HTTP failure classes. `Transient` is retried by the fetcher
/// itself; everything else surfaces to the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient network error for {url}: {message}")]
    Transient { url: String, message: String },
    #[error("permanent HTTP {status} for {url}")]
    Permanent { url: String, status: u16 },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Content extraction outcomes. Quality problems are ordinary values here,
/// never panics: the extractor reports and the caller decides.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("page not found: {0}")]
    NotFound(String),
    #[error("blocked with HTTP {status}: {url}")]
    Blocked { url: String, status: u16 },
    #[error("no content in page: {0}")]
    Empty(String),
    #[error("content failed quality gate (score {score:.2}): {url}")]
    QualityFail { url: String, score: f64 },
    #[error("extraction timed out: {0}")]
    Timeout(String),
    #[error("extraction cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI provider rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("AI provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("failed to parse AI response: {0}")]
    Parse(String),
    #[error("AI retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("AI call cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database deadlock retries exhausted after {attempts} attempts")]
    DeadlockRetryExhausted { attempts: u32 },
    #[error("persistence queue is shut down")]
    Closed,
    #[error("database write failed: {0}")]
    Write(String),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

/// True for the SQLite error shapes worth retrying with a fresh
/// transaction: busy/locked are this backend's deadlock reports.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration v{version} failed: {source}")]
    Failed {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let e = FetchError::Transient {
            url: "http://x".into(),
            message: "connect refused".into(),
        };
        assert!(e.is_transient());
        let e = FetchError::Permanent {
            url: "http://x".into(),
            status: 404,
        };
        assert!(!e.is_transient());
    }

    #[test]
    fn retryable_db_errors_are_lock_shaped() {
        assert!(is_retryable_db_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_retryable_db_error(&sqlx::Error::RowNotFound));
    }
}
