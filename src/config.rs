use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;

use crate::error::ConfigError;

/// Runtime configuration, read once at startup from the environment.
///
/// Required keys fail startup with a descriptive error; everything else has
/// a documented default. The struct is built exactly once and handed to
/// every component through `AppContext`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    // LLM provider
    pub ai_endpoint: String,
    pub ai_api_key: String,
    pub rps: u32,
    pub summarization_model: String,
    pub categorization_model: String,
    pub digest_model: String,

    // Output adapters
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_chat_id_news: Option<String>,
    pub telegraph_access_token: Option<String>,

    // Pipeline sizing
    pub max_workers: usize,
    pub browser_concurrency: usize,
    pub cache_ttl: Duration,
    pub cache_dir: String,
    pub min_content_length: usize,
    pub max_content_length: usize,
    pub render_timeout_first_ms: u64,
    pub render_total_budget_ms: u64,

    // Taxonomy
    pub news_categories: Vec<String>,
    pub default_category: String,
    /// Minimum processed articles a category needs for a daily summary.
    pub min_articles_for_summary: usize,

    // Scheduler
    pub scheduler_check_interval: Duration,
    pub scheduler_stuck_hours: i64,
    pub scheduler_task_timeout: Duration,

    // HTTP server
    pub listen: String,
    pub log_level: String,
}

fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    var(name).ok_or(ConfigError::MissingVar(name))
}

fn parse_num<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            var: name,
            message: format!("'{raw}' is not a valid number"),
        }),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let news_categories: Vec<String> = var("NEWS_CATEGORIES")
            .unwrap_or_else(|| "Business,Tech,Science,Nature,Serbia,Marketing,Other".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Config {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://data/vesti.db".to_string()),
            ai_endpoint: required("GEMINI_API_ENDPOINT")?,
            ai_api_key: required("GEMINI_API_KEY")?,
            rps: parse_num("RPS", 3u32)?,
            summarization_model: var("SUMMARIZATION_MODEL").unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            categorization_model: var("CATEGORIZATION_MODEL").unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            digest_model: var("DIGEST_MODEL").unwrap_or_else(|| "gemini-2.0-pro".to_string()),
            telegram_token: var("TELEGRAM_TOKEN"),
            telegram_chat_id: var("TELEGRAM_CHAT_ID"),
            telegram_chat_id_news: var("TELEGRAM_CHAT_ID_NEWS"),
            telegraph_access_token: var("TELEGRAPH_ACCESS_TOKEN"),
            max_workers: parse_num("MAX_WORKERS", 5usize)?,
            browser_concurrency: parse_num("BROWSER_CONCURRENCY", 2usize)?,
            cache_ttl: Duration::from_secs(parse_num("CACHE_TTL", 86_400u64)?),
            cache_dir: var("CACHE_DIR").unwrap_or_else(|| "./data/cache".to_string()),
            min_content_length: parse_num("MIN_CONTENT_LENGTH", 200usize)?,
            max_content_length: parse_num("MAX_CONTENT_LENGTH", 10_000usize)?,
            render_timeout_first_ms: parse_num("PLAYWRIGHT_TIMEOUT_FIRST_MS", 10_000u64)?,
            render_total_budget_ms: parse_num("PLAYWRIGHT_TOTAL_BUDGET_MS", 45_000u64)?,
            news_categories,
            default_category: var("DEFAULT_CATEGORY").unwrap_or_else(|| "Other".to_string()),
            min_articles_for_summary: parse_num("MIN_ARTICLES_FOR_SUMMARY", 2usize)?,
            scheduler_check_interval: Duration::from_secs(parse_num(
                "SCHEDULER_CHECK_INTERVAL_SECONDS",
                60u64,
            )?),
            scheduler_stuck_hours: parse_num("SCHEDULER_STUCK_HOURS", 2i64)?,
            scheduler_task_timeout: Duration::from_secs(parse_num(
                "SCHEDULER_TASK_TIMEOUT_SECONDS",
                0u64,
            )?),
            listen: var("LISTEN").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rps == 0 {
            return Err(ConfigError::Invalid {
                var: "RPS",
                message: "rate limit must be at least 1 request per second".into(),
            });
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_WORKERS",
                message: "worker pool must have at least 1 worker".into(),
            });
        }
        if self.min_content_length >= self.max_content_length {
            return Err(ConfigError::Invalid {
                var: "MIN_CONTENT_LENGTH",
                message: format!(
                    "minimum content length {} must be below maximum {}",
                    self.min_content_length, self.max_content_length
                ),
            });
        }
        if self.min_articles_for_summary == 0 {
            return Err(ConfigError::Invalid {
                var: "MIN_ARTICLES_FOR_SUMMARY",
                message: "a category needs at least 1 article for a summary".into(),
            });
        }
        if self.news_categories.is_empty() {
            return Err(ConfigError::Invalid {
                var: "NEWS_CATEGORIES",
                message: "at least one category is required".into(),
            });
        }
        let mut seen = HashSet::new();
        for c in &self.news_categories {
            if !seen.insert(c.as_str()) {
                return Err(ConfigError::Invalid {
                    var: "NEWS_CATEGORIES",
                    message: format!("duplicate category '{c}'"),
                });
            }
        }
        if !self.news_categories.iter().any(|c| c == &self.default_category) {
            return Err(ConfigError::Invalid {
                var: "DEFAULT_CATEGORY",
                message: format!(
                    "default category '{}' is not in NEWS_CATEGORIES",
                    self.default_category
                ),
            });
        }
        Ok(())
    }

    /// Timeout applied to a scheduled task; `None` means disabled (0).
    pub fn task_timeout(&self) -> Option<Duration> {
        if self.scheduler_task_timeout.is_zero() {
            None
        } else {
            Some(self.scheduler_task_timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database_url: "sqlite::memory:".into(),
            ai_endpoint: "http://localhost/v1/chat/completions".into(),
            ai_api_key: "test".into(),
            rps: 3,
            summarization_model: "m1".into(),
            categorization_model: "m1".into(),
            digest_model: "m2".into(),
            telegram_token: None,
            telegram_chat_id: None,
            telegram_chat_id_news: None,
            telegraph_access_token: None,
            max_workers: 5,
            browser_concurrency: 2,
            cache_ttl: Duration::from_secs(86_400),
            cache_dir: "./data/cache".into(),
            min_content_length: 200,
            max_content_length: 10_000,
            render_timeout_first_ms: 10_000,
            render_total_budget_ms: 45_000,
            news_categories: vec!["Business".into(), "Tech".into(), "Other".into()],
            default_category: "Other".into(),
            min_articles_for_summary: 2,
            scheduler_check_interval: Duration::from_secs(60),
            scheduler_stuck_hours: 2,
            scheduler_task_timeout: Duration::from_secs(0),
            listen: "127.0.0.1:0".into(),
            log_level: "info".into(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn zero_rps_rejected() {
        let mut c = base();
        c.rps = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn default_category_must_be_known() {
        let mut c = base();
        c.default_category = "Sports".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn min_must_be_below_max() {
        let mut c = base();
        c.min_content_length = 10_000;
        assert!(c.validate().is_err());
    }

    #[test]
    fn zero_summary_threshold_rejected() {
        let mut c = base();
        c.min_articles_for_summary = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn zero_timeout_disables_task_timeout() {
        let c = base();
        assert!(c.task_timeout().is_none());
        let mut c = base();
        c.scheduler_task_timeout = Duration::from_secs(30);
        assert_eq!(c.task_timeout(), Some(Duration::from_secs(30)));
    }
}
