//! Rate-limited LLM client: unified article analysis, selector discovery
//! and category summaries over an OpenAI-compatible chat endpoint.
//!
//! Every outbound call passes the global token bucket, retries included.
//! Responses are JSON; the client parses then validates, retries once with
//! a stricter prompt when required fields are missing, and returns typed
//! errors on exhaustion - never placeholder content.

pub mod cache;
pub mod limiter;
pub mod prompts;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AiError;
use crate::models::{AdType, CategoryScore, UnifiedAnalysis};

use cache::{cache_key, ResponseCache};
use limiter::RateLimiter;

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub summarization_model: String,
    pub categorization_model: String,
    pub digest_model: String,
    pub rps: u32,
    pub max_retries: u32,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ArticleBrief {
    pub title: String,
    pub summary: String,
}

pub struct AiClient {
    http: reqwest::Client,
    config: AiConfig,
    limiter: Arc<RateLimiter>,
    cache: ResponseCache,
    calls_made: AtomicU64,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

impl AiClient {
    pub fn new(config: AiConfig) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Arc::new(Self {
            limiter: RateLimiter::new(config.rps),
            cache: ResponseCache::new(config.cache_capacity, config.cache_ttl),
            calls_made: AtomicU64::new(0),
            http,
            config,
        }))
    }

    /// Outbound LLM calls made since startup (cache hits excluded).
    pub fn calls_made(&self) -> u64 {
        self.calls_made.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// One raw chat completion. Honors the limiter; 429 waits out
    /// `retry_after` before the next attempt is allowed.
    async fn chat(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
        cancel: &CancellationToken,
    ) -> Result<String, AiError> {
        self.limiter.acquire(cancel).await?;
        self.calls_made.fetch_add(1, Ordering::Relaxed);

        let payload = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let request = self
            .http
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload);

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| AiError::Provider {
                status: 0,
                message: e.to_string(),
            })?,
            _ = cancel.cancelled() => return Err(AiError::Cancelled),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5);
            return Err(AiError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Provider {
                status: status.as_u16(),
                message: message.chars().take(300).collect(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AiError::Parse("empty completion".into()));
        }
        Ok(content)
    }

    /// Chat with transparent handling of rate limits and transient provider
    /// errors. Parse failures are NOT retried here - the caller owns those,
    /// since the fix is a stricter prompt, not a resend.
    async fn chat_with_retry(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
        cancel: &CancellationToken,
    ) -> Result<String, AiError> {
        let mut attempt = 0u32;
        loop {
            match self.chat(model, prompt, max_tokens, temperature, cancel).await {
                Ok(content) => return Ok(content),
                Err(AiError::RateLimited { retry_after_secs }) => {
                    // Honor the provider: nothing outbound until the window
                    // passes, regardless of attempt count.
                    debug!(retry_after_secs, "provider rate limited, waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(retry_after_secs)) => {}
                        _ = cancel.cancelled() => return Err(AiError::Cancelled),
                    }
                }
                Err(e @ AiError::Provider { .. }) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt.min(5)));
                    warn!(attempt, error = %e, "AI provider error, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(AiError::Cancelled),
                    }
                }
                Err(AiError::Provider { status, message }) => {
                    return Err(AiError::Exhausted {
                        attempts: self.config.max_retries + 1,
                        last: format!("provider {status}: {message}"),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unified analysis: summary, categories, ad verdict, optimized title
    /// and publication date in one structured call.
    pub async fn analyze_article_complete(
        &self,
        title: &str,
        content: &str,
        url: &str,
        categories: &[String],
        cancel: &CancellationToken,
    ) -> Result<UnifiedAnalysis, AiError> {
        if content.trim().chars().count() < 30 {
            return Err(AiError::Parse(format!(
                "content too short for analysis ({} chars)",
                content.trim().chars().count()
            )));
        }

        let key = cache_key("unified", &[title, content, url]);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(analysis) = parse_unified(&cached) {
                debug!(url, "unified analysis served from cache");
                return Ok(analysis);
            }
        }

        let base_prompt = prompts::unified_article_analysis(title, content, url, categories);
        let mut last_error = String::new();
        let attempts = self.config.max_retries + 1;

        for attempt in 0..attempts {
            let prompt = if attempt == 0 {
                base_prompt.clone()
            } else {
                format!("{base_prompt}{}", prompts::strict_retry_suffix())
            };

            let response = self
                .chat_with_retry(&self.config.summarization_model, &prompt, 1500, 0.2, cancel)
                .await?;

            match extract_json_object(&response).and_then(|json| parse_unified(&json).map(|a| (json, a))) {
                Ok((json, analysis)) => {
                    self.cache.put(key, json);
                    return Ok(analysis);
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "unified analysis response invalid");
                    last_error = e.to_string();
                }
            }
        }

        Err(AiError::Exhausted {
            attempts,
            last: last_error,
        })
    }

    /// Propose CSS selectors for a domain from a compressed DOM skeleton.
    pub async fn extract_selectors(
        &self,
        compressed_dom: &str,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AiError> {
        let key = cache_key("selectors", &[domain, compressed_dom]);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(selectors) = parse_selectors(&cached) {
                return Ok(selectors);
            }
        }

        let prompt = prompts::selector_discovery(domain, compressed_dom);
        let response = self
            .chat_with_retry(&self.config.categorization_model, &prompt, 400, 0.1, cancel)
            .await?;
        let json = extract_json_object(&response)?;
        let selectors = parse_selectors(&json)?;
        self.cache.put(key, json);
        Ok(selectors)
    }

    /// Daily overview text for one category, used to build DailySummary
    /// rows. The digest itself is assembled without AI.
    pub async fn category_summary(
        &self,
        category: &str,
        briefs: &[ArticleBrief],
        cancel: &CancellationToken,
    ) -> Result<String, AiError> {
        let mut articles_text = String::new();
        for brief in briefs {
            articles_text.push_str(&format!("Заголовок: {}\n", brief.title));
            if !brief.summary.is_empty() {
                let short: String = brief.summary.chars().take(300).collect();
                articles_text.push_str(&format!("Описание: {short}\n"));
            }
            articles_text.push_str("---\n");
        }

        let key = cache_key("category_summary", &[category, &articles_text]);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let prompt = prompts::category_summary(category, &articles_text);
        let response = self
            .chat_with_retry(&self.config.digest_model, &prompt, 1000, 0.4, cancel)
            .await?;
        let text = response.trim().to_string();
        if text.len() < 20 {
            return Err(AiError::Parse("category summary too short".into()));
        }
        self.cache.put(key, text.clone());
        Ok(text)
    }
}

/// Pull the first JSON object out of a completion that may be wrapped in
/// markdown fences or prose.
fn extract_json_object(response: &str) -> Result<String, AiError> {
    let start = response
        .find('{')
        .ok_or_else(|| AiError::Parse("no JSON object in response".into()))?;
    let end = response
        .rfind('}')
        .ok_or_else(|| AiError::Parse("unterminated JSON object".into()))?;
    if end < start {
        return Err(AiError::Parse("malformed JSON object".into()));
    }
    Ok(response[start..=end].to_string())
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    optimized_title: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    category_confidences: Vec<f64>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    is_advertisement: bool,
    #[serde(default)]
    ad_type: Option<String>,
    #[serde(default)]
    ad_confidence: f64,
    #[serde(default)]
    ad_reasoning: Option<String>,
    #[serde(default)]
    ad_markers: Vec<String>,
    #[serde(default)]
    publication_date: Option<String>,
}

/// Parse-then-validate: unknown fields are ignored, missing required
/// fields are an error so the caller can retry with a stricter prompt.
fn parse_unified(json: &str) -> Result<UnifiedAnalysis, AiError> {
    let raw: RawAnalysis =
        serde_json::from_str(json).map_err(|e| AiError::Parse(e.to_string()))?;

    let summary = raw
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AiError::Parse("missing required field: summary".into()))?;

    let mut names = raw.categories;
    if names.is_empty() {
        if let Some(single) = raw.category {
            names.push(single);
        }
    }
    let names: Vec<String> = names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        return Err(AiError::Parse("missing required field: categories".into()));
    }

    let categories = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| CategoryScore {
            name,
            confidence: raw
                .category_confidences
                .get(i)
                .copied()
                .unwrap_or(0.8)
                .clamp(0.0, 1.0),
        })
        .collect();

    let publication_date = raw
        .publication_date
        .as_deref()
        .and_then(parse_iso_date);

    Ok(UnifiedAnalysis {
        optimized_title: raw
            .optimized_title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        categories,
        summary: Some(summary),
        is_advertisement: raw.is_advertisement,
        ad_confidence: raw.ad_confidence.clamp(0.0, 1.0),
        ad_type: raw
            .ad_type
            .as_deref()
            .map(AdType::parse)
            .unwrap_or(AdType::NewsArticle),
        ad_reasoning: raw
            .ad_reasoning
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "combined analysis".to_string()),
        ad_markers: raw.ad_markers,
        publication_date,
    })
}

fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

#[derive(Debug, Deserialize)]
struct RawSelectors {
    #[serde(default)]
    selectors: Vec<String>,
}

fn parse_selectors(json: &str) -> Result<Vec<String>, AiError> {
    let raw: RawSelectors =
        serde_json::from_str(json).map_err(|e| AiError::Parse(e.to_string()))?;
    let valid: Vec<String> = raw
        .selectors
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && scraper::Selector::parse(s).is_ok())
        .take(3)
        .collect();
    if valid.is_empty() {
        return Err(AiError::Parse("no usable selectors in response".into()));
    }
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_RESPONSE: &str = r#"
        Here is the analysis you asked for:
        ```json
        {
            "optimized_title": "Компания запустила новый продукт",
            "original_categories": ["technology_innovation"],
            "categories": ["Tech", "Business"],
            "category_confidences": [0.9, 0.7],
            "summary": "Компания представила новый продукт. Запуск прошёл в Белграде. Аналитики ждут роста продаж. Решение принято советом директоров. Подробности появятся позже.",
            "is_advertisement": false,
            "ad_type": "news_article",
            "ad_confidence": 0.05,
            "ad_reasoning": "Reports a product launch as news",
            "publication_date": "2025-01-15",
            "unknown_future_field": 42
        }
        ```
    "#;

    #[test]
    fn parses_fenced_response_with_unknown_fields() {
        let json = extract_json_object(GOOD_RESPONSE).unwrap();
        let analysis = parse_unified(&json).unwrap();
        assert_eq!(analysis.optimized_title.as_deref(), Some("Компания запустила новый продукт"));
        assert_eq!(analysis.categories.len(), 2);
        assert_eq!(analysis.categories[0].name, "Tech");
        assert!((analysis.categories[0].confidence - 0.9).abs() < 1e-9);
        assert!(!analysis.is_advertisement);
        assert_eq!(
            analysis.publication_date,
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
    }

    #[test]
    fn missing_summary_is_a_parse_error() {
        let json = r#"{"categories": ["Tech"]}"#;
        assert!(matches!(parse_unified(json), Err(AiError::Parse(_))));
    }

    #[test]
    fn single_category_field_is_accepted() {
        let json = r#"{"summary": "Достаточно длинное резюме новости.", "category": "Business"}"#;
        let analysis = parse_unified(json).unwrap();
        assert_eq!(analysis.categories.len(), 1);
        assert_eq!(analysis.categories[0].name, "Business");
        assert!((analysis.categories[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn confidences_are_clamped() {
        let json = r#"{
            "summary": "Текст резюме для проверки ограничений значений.",
            "categories": ["Tech"],
            "category_confidences": [1.7],
            "ad_confidence": -0.3
        }"#;
        let analysis = parse_unified(json).unwrap();
        assert!((analysis.categories[0].confidence - 1.0).abs() < 1e-9);
        assert!(analysis.ad_confidence.abs() < 1e-9);
    }

    #[test]
    fn selector_parsing_validates_css() {
        let json = r##"{"selectors": [".article__text", "<<<not-css>>>", "main article", "#content", ".extra"]}"##;
        let selectors = parse_selectors(json).unwrap();
        assert_eq!(selectors, vec![".article__text", "main article", "#content"]);
    }

    #[test]
    fn unusable_selectors_are_an_error() {
        let json = r#"{"selectors": []}"#;
        assert!(parse_selectors(json).is_err());
    }

    #[test]
    fn ad_fields_round_trip() {
        let json = r#"{
            "summary": "Реклама курса с огромной скидкой, успейте записаться сегодня.",
            "categories": ["Marketing"],
            "is_advertisement": true,
            "ad_type": "product_promotion",
            "ad_confidence": 0.92,
            "ad_markers": ["скидка", "купи"]
        }"#;
        let analysis = parse_unified(json).unwrap();
        assert!(analysis.is_advertisement);
        assert_eq!(analysis.ad_type, AdType::ProductPromotion);
        assert!(analysis.ad_confidence > 0.9);
        assert_eq!(analysis.ad_markers.len(), 2);
    }
}
