//! Multi-strategy article body extraction.
//!
//! Strategies run in a fixed order and exit early on the first body that
//! passes the quality gate: learned selectors, readability, structured
//! data, the prioritized selector ladder, headless rendering, and finally
//! AI-assisted selector discovery for domains that keep failing. Every
//! attempt is recorded in extraction memory so the next article from the
//! same domain starts from what already worked.

pub mod metadata;
pub mod quality;
pub mod selectors;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::ai::AiClient;
use crate::error::{ExtractError, FetchError};
use crate::html::{domain_of, harvest_media};
use crate::models::MediaFile;
use crate::http::{needs_js_rendering, FetchOptions, HttpFetcher};
use crate::memory::{AttemptRecord, ExtractionMemory};
use crate::render::BrowserPool;

use quality::{truncate_at_sentence, QualityGate};

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub min_content_length: usize,
    pub max_content_length: usize,
    pub render_total_budget_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub content: String,
    pub strategy: String,
    pub selector: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub quality: f64,
    /// Media harvested from the page, for backfilling articles that came
    /// in without any.
    pub media: Vec<MediaFile>,
}

pub struct ContentExtractor {
    http: Arc<HttpFetcher>,
    render: Arc<BrowserPool>,
    memory: Arc<ExtractionMemory>,
    ai: Arc<AiClient>,
    gate: QualityGate,
    config: ExtractorConfig,
}

impl ContentExtractor {
    pub fn new(
        http: Arc<HttpFetcher>,
        render: Arc<BrowserPool>,
        memory: Arc<ExtractionMemory>,
        ai: Arc<AiClient>,
        config: ExtractorConfig,
    ) -> Self {
        Self {
            gate: QualityGate::new(config.min_content_length),
            http,
            render,
            memory,
            ai,
            config,
        }
    }

    /// Extract the canonical article body for a URL, or report why not.
    pub async fn extract(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Extracted, ExtractError> {
        let domain = domain_of(url).ok_or_else(|| ExtractError::NotFound(url.to_string()))?;
        let mut html = self.fetch_html(url, cancel).await?;
        let mut publication_date = metadata::extract_publication_date(&html);
        let media = harvest_media(&html, url);

        let snapshot = self.memory.lookup(&domain).await.unwrap_or_default();

        // Strategies 1-4 against the plain HTML.
        if let Some(extracted) = self
            .static_ladder(url, &domain, &html, snapshot.is_stable(), cancel)
            .await?
        {
            return Ok(self.finish(extracted, publication_date, media));
        }

        // Listing pages hide the body behind a "read more" hop; follow once
        // and keep the longer result.
        if let Some(full_url) = metadata::find_read_more_link(&html, url) {
            debug!(url, full_url = %full_url, "following full-article link");
            if let Ok(full_html) = self.fetch_html(&full_url, cancel).await {
                if publication_date.is_none() {
                    publication_date = metadata::extract_publication_date(&full_html);
                }
                if let Some(extracted) = self
                    .static_ladder(&full_url, &domain, &full_html, snapshot.is_stable(), cancel)
                    .await?
                {
                    let media = harvest_media(&full_html, &full_url);
                    return Ok(self.finish(extracted, publication_date, media));
                }
                if full_html.len() > html.len() {
                    html = full_html;
                }
            }
        }

        // Strategy 5: headless rendering, for domains known to need it or
        // because the static ladder came up short - and only while the
        // domain's render budget has not been exhausted by recent
        // failures. Each failure extends the cooldown; a success resets it.
        let render_budget_ok = self.memory.render_budget_available(&domain).await.unwrap_or(true);
        if render_budget_ok {
            let looked_js_rendered = needs_js_rendering(&html);
            let budget = snapshot
                .render_timeout_ms()
                .map(|ms| ms as u64)
                .unwrap_or(self.config.render_total_budget_ms)
                .min(self.config.render_total_budget_ms);
            let started = Instant::now();
            match self.render.render(url, None, budget, cancel).await {
                Ok(rendered) => {
                    let _ = self.memory.record_render_outcome(&domain, true).await;
                    // Pages that looked like JS shells mark the whole
                    // domain as render-requiring.
                    if !snapshot.needs_render() && looked_js_rendered {
                        let _ = self.memory.set_needs_render(&domain, true).await;
                    }
                    if publication_date.is_none() {
                        publication_date = metadata::extract_publication_date(&rendered);
                    }
                    if let Some(mut extracted) = self
                        .static_ladder(url, &domain, &rendered, false, cancel)
                        .await?
                    {
                        extracted.strategy = format!("render+{}", extracted.strategy);
                        let media = harvest_media(&rendered, url);
                        return Ok(self.finish(extracted, publication_date, media));
                    }
                    html = rendered;
                }
                Err(ExtractError::Cancelled) => return Err(ExtractError::Cancelled),
                Err(e) => {
                    warn!(url, error = %e, "headless render failed");
                    let _ = self.memory.record_render_outcome(&domain, false).await;
                    self.record(url, &domain, "render", None, false, 0.0, started, Some(&e.to_string()))
                        .await;
                }
            }
        } else {
            debug!(url, domain = %domain, "render budget exhausted recently, skipping headless attempt");
        }

        // Strategy 6: AI selector discovery for persistently failing,
        // unstable domains with budget remaining.
        if self.memory.should_invoke_ai(&domain).await.unwrap_or(false) {
            if let Some(extracted) = self.ai_discovery(url, &domain, &html, cancel).await? {
                let media = harvest_media(&html, url);
                return Ok(self.finish(extracted, publication_date, media));
            }
        }

        let started = Instant::now();
        self.record(url, &domain, "all_strategies", None, false, 0.0, started, Some("quality gate"))
            .await;
        Err(ExtractError::QualityFail {
            url: url.to_string(),
            score: 0.0,
        })
    }

    fn finish(
        &self,
        mut extracted: Extracted,
        publication_date: Option<NaiveDate>,
        media: Vec<MediaFile>,
    ) -> Extracted {
        extracted.content =
            truncate_at_sentence(&extracted.content, self.config.max_content_length);
        extracted.publication_date = publication_date;
        extracted.media = media;
        extracted
    }

    async fn fetch_html(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ExtractError> {
        let response = self
            .http
            .fetch(url, &FetchOptions::default(), cancel)
            .await
            .map_err(|e| match e {
                FetchError::Permanent { url, status } if status == 404 || status == 410 => {
                    ExtractError::NotFound(url)
                }
                FetchError::Permanent { url, status } => ExtractError::Blocked { url, status },
                FetchError::Transient { url, .. } => ExtractError::Timeout(url),
                FetchError::Cancelled => ExtractError::Cancelled,
            })?;
        if !response.is_html() {
            return Err(ExtractError::Empty(url.to_string()));
        }
        let html = response.text();
        if html.trim().is_empty() {
            return Err(ExtractError::Empty(url.to_string()));
        }
        Ok(html)
    }

    /// Strategies 1-4. `stable_domain` marks a hit on a stable learned
    /// pattern as saved AI credits.
    async fn static_ladder(
        &self,
        url: &str,
        domain: &str,
        html: &str,
        stable_domain: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Extracted>, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        // 1. Learned selectors, stable-first, best three.
        let snapshot = self.memory.lookup(domain).await.unwrap_or_default();
        for pattern in snapshot.best_patterns().take(3) {
            let started = Instant::now();
            let candidate = selectors::apply_selector(html, &pattern.selector_pattern);
            if let Some(extracted) = self
                .judge(
                    url,
                    domain,
                    "learned_selector",
                    Some(pattern.selector_pattern.as_str()),
                    candidate,
                    started,
                )
                .await
            {
                if stable_domain && pattern.is_stable {
                    let _ = self.memory.note_credits_saved(domain).await;
                }
                return Ok(Some(extracted));
            }
        }

        // 2. Readability.
        let started = Instant::now();
        let candidate = readability_text(html, url);
        if let Some(extracted) = self
            .judge(url, domain, "readability", None, candidate, started)
            .await
        {
            return Ok(Some(extracted));
        }

        // 3. Structured data: JSON-LD body, then microdata, then OG.
        let started = Instant::now();
        let candidate = metadata::json_ld_body(html)
            .or_else(|| selectors::apply_selector(html, "[itemprop='articleBody']"))
            .or_else(|| metadata::og_description(html));
        if let Some(extracted) = self
            .judge(url, domain, "structured_data", None, candidate, started)
            .await
        {
            return Ok(Some(extracted));
        }

        // 4. Prioritized selector ladder; a passing selector becomes a
        // learned pattern for the domain.
        let started = Instant::now();
        if let Some((text, selector)) =
            selectors::first_candidate(html, self.config.min_content_length)
        {
            if let Some(extracted) = self
                .judge(url, domain, "css_selector", Some(selector), Some(text), started)
                .await
            {
                return Ok(Some(extracted));
            }
        }

        Ok(None)
    }

    async fn ai_discovery(
        &self,
        url: &str,
        domain: &str,
        html: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Extracted>, ExtractError> {
        info!(domain, "attempting AI selector discovery");
        let compressed = selectors::compress_dom(html, 6000);
        let proposed = match self.ai.extract_selectors(&compressed, domain, cancel).await {
            Ok(selectors) => selectors,
            Err(e) => {
                warn!(domain, error = %e, "AI selector discovery failed");
                return Ok(None);
            }
        };
        if proposed.is_empty() {
            return Ok(None);
        }
        let raw = serde_json::to_string(&proposed).unwrap_or_else(|_| "[]".to_string());
        let _ = self.memory.record_ai_discovery(domain, &proposed, &raw).await;

        // Discovered selectors only count once they survive validation
        // against the live page.
        for selector in &proposed {
            let started = Instant::now();
            let candidate = selectors::apply_selector(html, selector);
            if let Some(mut extracted) = self
                .judge(url, domain, "css_selector", Some(selector.as_str()), candidate, started)
                .await
            {
                extracted.strategy = "ai_discovered".to_string();
                return Ok(Some(extracted));
            }
        }
        Ok(None)
    }

    /// Gate a candidate body and record the attempt either way.
    async fn judge(
        &self,
        url: &str,
        domain: &str,
        strategy: &str,
        selector: Option<&str>,
        candidate: Option<String>,
        started: Instant,
    ) -> Option<Extracted> {
        let text = candidate?;
        let report = self.gate.evaluate(&text);
        self.record(url, domain, strategy, selector, report.passed, report.score, started, None)
            .await;
        if report.passed {
            debug!(url, strategy, length = report.length, "extraction strategy succeeded");
            Some(Extracted {
                content: text.trim().to_string(),
                strategy: strategy.to_string(),
                selector: selector.map(str::to_string),
                publication_date: None,
                quality: report.score,
                media: Vec::new(),
            })
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        url: &str,
        domain: &str,
        strategy: &str,
        selector: Option<&str>,
        success: bool,
        quality: f64,
        started: Instant,
        error: Option<&str>,
    ) {
        let result = self
            .memory
            .record_attempt(AttemptRecord {
                url,
                domain,
                strategy,
                selector,
                discovered_by: "heuristic",
                success,
                quality,
                elapsed_ms: started.elapsed().as_millis() as i64,
                error,
                http_status: None,
            })
            .await;
        if let Err(e) = result {
            warn!(domain, error = %e, "failed to record extraction attempt");
        }
    }
}

/// Mozilla-readability style extraction over already-fetched HTML.
fn readability_text(html: &str, url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let mut cursor = Cursor::new(html.as_bytes());
    let product = readability::extractor::extract(&mut cursor, &parsed).ok()?;
    let text = product.text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readability_extracts_article() {
        let html = r#"
            <html><head><title>Test</title></head><body>
            <nav>Navigation</nav>
            <article>
              <h1>Title</h1>
              <p>The first paragraph carries most of the substance of this test article and is written to be reasonably long.</p>
              <p>The second paragraph adds enough additional sentences for extraction to have something to work with.</p>
            </article>
            </body></html>
        "#;
        let text = readability_text(html, "https://news.test/a").unwrap();
        assert!(text.contains("first paragraph"));
    }
}
