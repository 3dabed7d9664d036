use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Configured origin kinds. `Custom` is the selector-driven page monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Rss,
    Telegram,
    Generic,
    Custom,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rss => "rss",
            SourceType::Telegram => "telegram",
            SourceType::Generic => "generic",
            SourceType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rss" => Some(SourceType::Rss),
            "telegram" => Some(SourceType::Telegram),
            "generic" => Some(SourceType::Generic),
            "custom" => Some(SourceType::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub source_type: String,
    pub url: String,
    pub enabled: bool,
    /// Per-type configuration blob (JSON object).
    pub config: String,
    pub fetch_interval: i64,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: i64,
}

impl Source {
    pub fn kind(&self) -> Option<SourceType> {
        SourceType::parse(&self.source_type)
    }

    pub fn config_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.config).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub url: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdType {
    NewsArticle,
    ProductPromotion,
    PersonalService,
    EventPromotion,
    AffiliateMarketing,
    SubscriptionPromo,
}

impl AdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdType::NewsArticle => "news_article",
            AdType::ProductPromotion => "product_promotion",
            AdType::PersonalService => "personal_service",
            AdType::EventPromotion => "event_promotion",
            AdType::AffiliateMarketing => "affiliate_marketing",
            AdType::SubscriptionPromo => "subscription_promo",
        }
    }

    pub fn parse(s: &str) -> AdType {
        match s {
            "product_promotion" => AdType::ProductPromotion,
            "personal_service" => AdType::PersonalService,
            "event_promotion" => AdType::EventPromotion,
            "affiliate_marketing" => AdType::AffiliateMarketing,
            "subscription_promo" => AdType::SubscriptionPromo,
            _ => AdType::NewsArticle,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub optimized_title: Option<String>,
    pub url: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub summary_processed: bool,
    pub category_processed: bool,
    pub ad_processed: bool,
    pub hash_content: Option<String>,
    pub is_advertisement: bool,
    pub ad_confidence: f64,
    pub ad_type: Option<String>,
    pub ad_reasoning: Option<String>,
    /// JSON array of marker strings.
    pub ad_markers: String,
    /// JSON array of `MediaFile`.
    pub media_files: String,
}

impl Article {
    pub fn media(&self) -> Vec<MediaFile> {
        serde_json::from_str(&self.media_files).unwrap_or_default()
    }

    pub fn display_title(&self) -> &str {
        self.optimized_title.as_deref().unwrap_or(&self.title)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub color: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ArticleCategory {
    pub article_id: i64,
    pub category_id: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct CategoryMapping {
    pub id: i64,
    pub ai_category: String,
    pub fixed_category: String,
    pub confidence_threshold: f64,
    pub is_active: bool,
    pub usage_count: i64,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExtractionPattern {
    pub id: i64,
    pub domain: String,
    pub selector_pattern: String,
    pub extraction_strategy: String,
    pub success_count: i64,
    pub failure_count: i64,
    pub quality_score_avg: f64,
    pub discovered_by: String,
    pub is_stable: bool,
    pub consecutive_successes: i64,
    pub consecutive_failures: i64,
}

impl ExtractionPattern {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DomainStability {
    pub id: i64,
    pub domain: String,
    pub is_stable: bool,
    pub success_rate_7d: f64,
    pub success_rate_30d: f64,
    pub total_attempts: i64,
    pub successful_attempts: i64,
    pub consecutive_successes: i64,
    pub consecutive_failures: i64,
    pub last_ai_analysis: Option<DateTime<Utc>>,
    pub needs_reanalysis: bool,
    pub needs_render: bool,
    pub render_timeout_ms: i64,
    pub render_failure_count: i64,
    pub last_render_failure_at: Option<DateTime<Utc>>,
    pub ai_credits_saved: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleSetting {
    pub id: i64,
    pub task_name: String,
    pub enabled: bool,
    pub schedule_type: String,
    pub hour: i64,
    pub minute: i64,
    /// JSON array, subset of 1..=7 (ISO weekday numbers).
    pub weekdays: String,
    pub timezone: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub is_running: bool,
    /// Opaque per-task configuration (JSON object).
    pub task_config: String,
}

impl ScheduleSetting {
    pub fn weekdays_list(&self) -> Vec<u32> {
        serde_json::from_str(&self.weekdays).unwrap_or_default()
    }

    pub fn task_config_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.task_config).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DailySummary {
    pub id: i64,
    pub date: NaiveDate,
    pub category: String,
    pub summary_text: String,
    pub articles_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProcessingStat {
    pub id: i64,
    pub date: NaiveDate,
    pub articles_fetched: i64,
    pub articles_processed: i64,
    pub api_calls_made: i64,
    pub errors_count: i64,
    pub processing_time_seconds: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct QueuedTask {
    pub id: i64,
    pub task_type: String,
    pub status: String,
    pub attempts: i64,
    pub error_message: Option<String>,
}

/// An item emerging from a source adapter, pre-filter.
#[derive(Debug, Clone)]
pub struct CandidateArticle {
    pub title: String,
    pub url: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    pub media_files: Vec<MediaFile>,
    /// Adapter-specific extras (forward info, selector, guid).
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    pub name: String,
    pub confidence: f64,
}

/// Result of one unified AI analysis call.
#[derive(Debug, Clone)]
pub struct UnifiedAnalysis {
    pub optimized_title: Option<String>,
    pub categories: Vec<CategoryScore>,
    pub summary: Option<String>,
    pub is_advertisement: bool,
    pub ad_confidence: f64,
    pub ad_type: AdType,
    pub ad_reasoning: String,
    pub ad_markers: Vec<String>,
    pub publication_date: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_round_trip() {
        let media = vec![MediaFile {
            url: "https://x.test/a.jpg".into(),
            media_type: MediaType::Image,
            thumbnail: None,
        }];
        let json = serde_json::to_string(&media).unwrap();
        assert!(json.contains("\"type\":\"image\""));
        let back: Vec<MediaFile> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, media);
    }

    #[test]
    fn ad_type_parse_defaults_to_news() {
        assert_eq!(AdType::parse("product_promotion"), AdType::ProductPromotion);
        assert_eq!(AdType::parse("garbage"), AdType::NewsArticle);
    }

    #[test]
    fn source_type_round_trip() {
        for t in [
            SourceType::Rss,
            SourceType::Telegram,
            SourceType::Generic,
            SourceType::Custom,
        ] {
            assert_eq!(SourceType::parse(t.as_str()), Some(t));
        }
        assert_eq!(SourceType::parse("reddit"), None);
    }

    #[test]
    fn pattern_success_rate() {
        let p = ExtractionPattern {
            id: 1,
            domain: "news.test".into(),
            selector_pattern: ".article".into(),
            extraction_strategy: "css_selector".into(),
            success_count: 8,
            failure_count: 2,
            quality_score_avg: 0.8,
            discovered_by: "heuristic".into(),
            is_stable: true,
            consecutive_successes: 6,
            consecutive_failures: 0,
        };
        assert!((p.success_rate() - 0.8).abs() < f64::EPSILON);
    }
}
