//! The full processing cycle: ingest candidates from every enabled source,
//! push unprocessed articles through extraction and unified AI analysis,
//! build per-category daily summaries, then assemble and emit the digest.
//!
//! Partial failures stay partial: a failing source or article is recorded
//! and the cycle continues; emission failures are retried next cycle.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ai::ArticleBrief;
use crate::context::AppContext;
use crate::digest::{build_digest_messages, DigestBlock};
use crate::error::{AiError, ExtractError};
use crate::filter::{ad_prefilter, hash_content};
use crate::html::canonical_url;
use crate::models::{Article, Source, SourceType, UnifiedAnalysis};
use crate::scheduler::TaskRunner;
use crate::store;

/// How many consecutive failures soft-disable a source.
const SOURCE_DISABLE_THRESHOLD: i64 = 10;
/// Articles taken into one AI processing pass.
const PROCESS_BATCH_LIMIT: i64 = 200;

/// Per-article failure outcome: cancellation is not an error, the item
/// simply stays retryable.
enum ArticleFailure {
    Cancelled,
    Failed(String),
}

#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub articles_fetched: u64,
    pub articles_processed: u64,
    pub api_calls_made: u64,
    pub errors: Vec<String>,
    pub digest_sent: bool,
    pub duration_seconds: u64,
}

pub struct Orchestrator {
    ctx: Arc<AppContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// One full cycle. `emit` controls steps 3-4 (summaries + digest);
    /// `news_processing` runs with `emit = false`.
    pub async fn run_cycle(&self, emit: bool, cancel: &CancellationToken) -> anyhow::Result<CycleStats> {
        let started = Instant::now();
        let api_calls_before = self.ctx.ai.calls_made();
        let mut stats = CycleStats::default();

        info!(emit, "processing cycle started");

        self.ingest_sources(&mut stats, cancel).await;
        if cancel.is_cancelled() {
            return Ok(stats);
        }

        self.process_articles(&mut stats, cancel).await;
        if cancel.is_cancelled() {
            return Ok(stats);
        }

        if emit {
            self.build_daily_summaries(&mut stats, cancel).await;
            self.emit_digest(&mut stats, cancel).await;
        }

        stats.api_calls_made = self.ctx.ai.calls_made() - api_calls_before;
        stats.duration_seconds = started.elapsed().as_secs();
        self.record_stats(&stats).await;

        info!(
            fetched = stats.articles_fetched,
            processed = stats.articles_processed,
            api_calls = stats.api_calls_made,
            errors = stats.errors.len(),
            duration_secs = stats.duration_seconds,
            "processing cycle finished"
        );
        Ok(stats)
    }

    // -----------------------------------------------------------------
    // Step 1: source ingestion
    // -----------------------------------------------------------------

    async fn ingest_sources(&self, stats: &mut CycleStats, cancel: &CancellationToken) {
        let sources = match self
            .ctx
            .queue
            .read(|pool| Box::pin(async move { store::get_enabled_sources(&pool).await }))
            .await
        {
            Ok(sources) => sources,
            Err(e) => {
                stats.errors.push(format!("loading sources: {e}"));
                return;
            }
        };

        let permits = Arc::new(Semaphore::new(self.ctx.config.max_workers));
        let mut handles = Vec::new();
        for source in sources {
            // Respect per-source fetch intervals.
            if let Some(last_fetch) = source.last_fetch {
                let due = last_fetch + chrono::Duration::seconds(source.fetch_interval.max(60));
                if Utc::now() < due {
                    debug!(source = %source.name, "not due for fetching yet");
                    continue;
                }
            }

            let ctx = self.ctx.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(ingest_one_source(&ctx, &source, &cancel).await)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Some(Ok(count))) => stats.articles_fetched += count,
                Ok(Some(Err(e))) => stats.errors.push(e),
                Ok(None) => {}
                Err(e) => stats.errors.push(format!("source task panicked: {e}")),
            }
        }
    }

    // -----------------------------------------------------------------
    // Step 2: extraction + AI analysis
    // -----------------------------------------------------------------

    async fn process_articles(&self, stats: &mut CycleStats, cancel: &CancellationToken) {
        let articles = match self
            .ctx
            .queue
            .read(|pool| {
                Box::pin(async move { store::get_unprocessed_articles(&pool, PROCESS_BATCH_LIMIT).await })
            })
            .await
        {
            Ok(articles) => articles,
            Err(e) => {
                stats.errors.push(format!("loading unprocessed articles: {e}"));
                return;
            }
        };
        if articles.is_empty() {
            debug!("no articles waiting for processing");
            return;
        }
        info!(count = articles.len(), "processing articles with AI");

        let permits = Arc::new(Semaphore::new(self.ctx.config.max_workers));
        let mut handles = Vec::new();
        for article in articles {
            let ctx = self.ctx.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(process_one_article(&ctx, article, &cancel).await)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Some(Ok(()))) => stats.articles_processed += 1,
                Ok(Some(Err(ArticleFailure::Failed(e)))) => stats.errors.push(e),
                Ok(Some(Err(ArticleFailure::Cancelled))) | Ok(None) => {}
                Err(e) => stats.errors.push(format!("article task panicked: {e}")),
            }
        }
    }

    // -----------------------------------------------------------------
    // Step 3: per-category daily summaries
    // -----------------------------------------------------------------

    async fn build_daily_summaries(&self, stats: &mut CycleStats, cancel: &CancellationToken) {
        let today = Utc::now().date_naive();
        let grouped = match self
            .ctx
            .queue
            .read(move |pool| Box::pin(async move { store::get_articles_for_date(&pool, today).await }))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                stats.errors.push(format!("loading today's articles: {e}"));
                return;
            }
        };

        let mut by_category: std::collections::HashMap<String, Vec<&(Article, Vec<String>)>> =
            std::collections::HashMap::new();
        for row in &grouped {
            // Advertisements stay out of the digest entirely.
            if row.0.is_advertisement {
                continue;
            }
            let primary = row.1.first().cloned().unwrap_or_else(|| {
                self.ctx.config.default_category.clone()
            });
            by_category.entry(primary).or_default().push(row);
        }

        for (category, rows) in by_category {
            if rows.len() < self.ctx.config.min_articles_for_summary || cancel.is_cancelled() {
                continue;
            }
            let briefs: Vec<ArticleBrief> = rows
                .iter()
                .map(|(article, _)| ArticleBrief {
                    title: article.display_title().to_string(),
                    summary: article.summary.clone().unwrap_or_default(),
                })
                .collect();

            match self.ctx.ai.category_summary(&category, &briefs, cancel).await {
                Ok(text) => {
                    let count = rows.len() as i64;
                    let category_owned = category.clone();
                    let write = self
                        .ctx
                        .queue
                        .write(
                            "daily_summaries",
                            Arc::new(move |conn| {
                                let category = category_owned.clone();
                                let text = text.clone();
                                Box::pin(async move {
                                    store::upsert_daily_summary(conn, today, &category, &text, count)
                                        .await
                                })
                            }),
                        )
                        .await;
                    if let Err(e) = write {
                        stats.errors.push(format!("saving summary for {category}: {e}"));
                    }
                }
                Err(AiError::Cancelled) => return,
                Err(e) => {
                    stats.errors.push(format!("summary for {category}: {e}"));
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Step 4: digest assembly and emission (no AI here)
    // -----------------------------------------------------------------

    async fn emit_digest(&self, stats: &mut CycleStats, cancel: &CancellationToken) {
        let today = Utc::now().date_naive();
        let summaries = match self
            .ctx
            .queue
            .read(move |pool| Box::pin(async move { store::get_daily_summaries(&pool, today).await }))
            .await
        {
            Ok(summaries) => summaries,
            Err(e) => {
                stats.errors.push(format!("loading daily summaries: {e}"));
                return;
            }
        };
        if summaries.is_empty() {
            debug!("no daily summaries, skipping digest");
            return;
        }

        let blocks: Vec<DigestBlock> = summaries
            .iter()
            .map(|s| DigestBlock {
                category: s.category.clone(),
                summary: s.summary_text.clone(),
                articles_count: s.articles_count,
            })
            .collect();

        let telegraph_url = match &self.ctx.telegraph {
            Some(publisher) => {
                let title = format!("Новости за {}", today.format("%d.%m.%Y"));
                match publisher.publish(&title, &blocks).await {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!(error = %e, "telegraph publication failed");
                        stats.errors.push(format!("telegraph: {e}"));
                        None
                    }
                }
            }
            None => None,
        };

        let messages = build_digest_messages(today, &blocks);
        if let Some(telegram) = &self.ctx.telegram {
            match telegram
                .send_digest(&messages, telegraph_url.as_deref(), cancel)
                .await
            {
                Ok(()) => stats.digest_sent = true,
                Err(e) => {
                    warn!(error = %e, "telegram digest delivery failed, will retry next cycle");
                    stats.errors.push(format!("telegram: {e}"));
                }
            }
        } else {
            debug!("telegram output not configured, digest not sent");
        }
    }

    async fn record_stats(&self, stats: &CycleStats) {
        let today = Utc::now().date_naive();
        let fetched = stats.articles_fetched as i64;
        let processed = stats.articles_processed as i64;
        let api_calls = stats.api_calls_made as i64;
        let errors = stats.errors.len() as i64;
        let seconds = stats.duration_seconds as i64;
        let write = self
            .ctx
            .queue
            .write(
                "processing_stats",
                Arc::new(move |conn| {
                    Box::pin(async move {
                        store::bump_processing_stats(
                            conn, today, fetched, processed, api_calls, errors, seconds,
                        )
                        .await
                    })
                }),
            )
            .await;
        if let Err(e) = write {
            error!(error = %e, "failed to record processing stats");
        }
    }
}

/// Fetch one source, filter its candidates and persist the new ones.
/// Returns the number of fresh articles, or a surfaced error string.
async fn ingest_one_source(
    ctx: &AppContext,
    source: &Source,
    cancel: &CancellationToken,
) -> Result<u64, String> {
    let Some(kind) = source.kind() else {
        return Err(format!("source '{}': unknown type '{}'", source.name, source.source_type));
    };
    let Some(adapter) = ctx.registry.get(kind) else {
        return Err(format!("source '{}': no adapter for '{}'", source.name, source.source_type));
    };

    // Backpressure from the write queue pauses ingestion, not the cycle.
    ctx.queue.wait_until_resumed().await;

    let fetch_context = ctx.fetch_context();
    let candidates = match adapter.fetch(&fetch_context, source, cancel).await {
        Ok(candidates) => candidates,
        Err(e) => {
            let message = e.to_string();
            record_source_outcome(ctx, source.id, Some(&message)).await;
            return Err(format!("source '{}': {message}", source.name));
        }
    };

    let allow_other_languages = source
        .config_json()
        .get("allow_other_languages")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut inserted = 0u64;
    for mut candidate in candidates {
        if cancel.is_cancelled() {
            break;
        }
        // The canonical URL form is the article's unique key.
        if let Some(canonical) = canonical_url(&candidate.url) {
            candidate.url = canonical;
        }
        if let Err(rejection) = ctx.filter.check(&candidate.title, &candidate.content, allow_other_languages) {
            debug!(url = %candidate.url, %rejection, "candidate filtered out");
            continue;
        }
        let hash = hash_content(&candidate.title, &candidate.content);

        // Already persisted content dedups here, before any AI spend.
        let hash_clone = hash.clone();
        let seen = ctx
            .queue
            .read(move |pool| {
                let hash = hash_clone.clone();
                Box::pin(async move { store::hash_seen(&pool, &hash).await })
            })
            .await
            .unwrap_or(false);
        if seen {
            debug!(url = %candidate.url, "duplicate content hash, skipping");
            continue;
        }

        let source_id = source.id;
        let candidate = Arc::new(candidate);
        let candidate_for_write = candidate.clone();
        let hash_for_write = hash.clone();
        let result = ctx
            .queue
            .write_returning("articles", move |conn| {
                let candidate = candidate_for_write.clone();
                let hash = hash_for_write.clone();
                Box::pin(async move {
                    store::upsert_article(&mut *conn, source_id, &candidate, &hash).await
                })
            })
            .await;
        match result {
            Ok((_, true)) => inserted += 1,
            Ok((_, false)) => {}
            Err(e) => warn!(url = %candidate.url, error = %e, "failed to store candidate"),
        }
    }

    record_source_outcome(ctx, source.id, None).await;
    if inserted > 0 {
        info!(source = %source.name, items = inserted, "fetched and stored items");
    }
    Ok(inserted)
}

async fn record_source_outcome(ctx: &AppContext, source_id: i64, error: Option<&str>) {
    let error = error.map(str::to_string);
    let write = ctx
        .queue
        .write(
            "sources",
            Arc::new(move |conn| {
                let error = error.clone();
                Box::pin(async move {
                    match error {
                        Some(ref message) => {
                            store::record_source_failure(
                                conn,
                                source_id,
                                message,
                                SOURCE_DISABLE_THRESHOLD,
                            )
                            .await
                        }
                        None => store::record_source_success(conn, source_id).await,
                    }
                })
            }),
        )
        .await;
    if let Err(e) = write {
        error!(source_id, error = %e, "failed to record source outcome");
    }
}

/// Extraction, unified analysis and persistence for one article. Per the
/// pipeline ordering contract: body first, then AI, then a single write
/// unit for all AI-derived fields.
async fn process_one_article(
    ctx: &AppContext,
    article: Article,
    cancel: &CancellationToken,
) -> Result<(), ArticleFailure> {
    let source_type = ctx
        .queue
        .read({
            let source_id = article.source_id;
            move |pool| Box::pin(async move { store::get_source(&pool, source_id).await })
        })
        .await
        .ok()
        .flatten()
        .and_then(|s| s.kind())
        .unwrap_or(SourceType::Rss);

    // Ensure a body: Telegram messages are complete as-is, everything else
    // goes through the extractor when the stored content is thin.
    let mut content = article.content.clone().unwrap_or_default();
    let needs_body = source_type != SourceType::Telegram
        && content.trim().chars().count() < ctx.config.min_content_length;
    if needs_body {
        match ctx.extractor.extract(&article.url, cancel).await {
            Ok(extracted) => {
                content = extracted.content;
                let hash = hash_content(&article.title, &content);
                let article_id = article.id;
                let content_for_write = content.clone();
                // Media may be backfilled even after processing completes;
                // everything else on the row stays frozen once processed.
                let media_json = if article.media().is_empty() && !extracted.media.is_empty() {
                    serde_json::to_string(&extracted.media).ok()
                } else {
                    None
                };
                let write = ctx
                    .queue
                    .write(
                        "articles",
                        Arc::new(move |conn| {
                            let content = content_for_write.clone();
                            let hash = hash.clone();
                            let media_json = media_json.clone();
                            Box::pin(async move {
                                store::set_article_content(&mut *conn, article_id, &content, &hash)
                                    .await?;
                                if let Some(ref media) = media_json {
                                    store::backfill_article_media(&mut *conn, article_id, media)
                                        .await?;
                                }
                                Ok(())
                            })
                        }),
                    )
                    .await;
                if let Err(e) = write {
                    return Err(ArticleFailure::Failed(format!(
                        "article {}: storing body: {e}",
                        article.id
                    )));
                }
            }
            Err(ExtractError::Cancelled) => return Err(ArticleFailure::Cancelled),
            Err(e) => {
                // Body retry happens on a later cycle; no AI call without a
                // body.
                return Err(ArticleFailure::Failed(format!(
                    "article {}: extraction: {e}",
                    article.id
                )));
            }
        }
    }
    if content.trim().is_empty() {
        content = article.title.clone();
    }

    // Lexical ad pre-filter feeds its markers into the stored record; the
    // AI verdict decides.
    let prefilter = ad_prefilter(&article.title, &content, &article.url);
    if prefilter.flagged {
        debug!(url = %article.url, score = prefilter.score, "ad pre-filter flagged candidate");
    }

    let analysis = match ctx
        .ai
        .analyze_article_complete(
            &article.title,
            &content,
            &article.url,
            &ctx.config.news_categories,
            cancel,
        )
        .await
    {
        Ok(analysis) => analysis,
        Err(AiError::Cancelled) => return Err(ArticleFailure::Cancelled),
        Err(e) => {
            return Err(ArticleFailure::Failed(format!(
                "article {}: AI analysis: {e}",
                article.id
            )))
        }
    };

    let resolved = ctx
        .categories
        .resolve(&analysis.categories)
        .await
        .map_err(|e| {
            ArticleFailure::Failed(format!("article {}: category resolution: {e}", article.id))
        })?;

    // Resolve category ids up front; links are written with the article
    // fields in one transaction.
    let mut links: Vec<(i64, f64)> = Vec::new();
    for category in &resolved {
        let name = category.name.clone();
        let row = ctx
            .queue
            .read(move |pool| {
                let name = name.clone();
                Box::pin(async move { store::get_category_by_name(&pool, &name).await })
            })
            .await
            .map_err(|e| {
                ArticleFailure::Failed(format!("article {}: category lookup: {e}", article.id))
            })?;
        if let Some(row) = row {
            links.push((row.id, category.confidence));
        }
    }

    if cancel.is_cancelled() {
        // No partial AI results are persisted on cancellation.
        return Err(ArticleFailure::Cancelled);
    }

    persist_analysis(ctx, &article, &analysis, &prefilter.markers, &links)
        .await
        .map_err(|e| {
            ArticleFailure::Failed(format!("article {}: persisting analysis: {e}", article.id))
        })?;

    debug!(url = %article.url, categories = links.len(), "article processed");
    Ok(())
}

async fn persist_analysis(
    ctx: &AppContext,
    article: &Article,
    analysis: &UnifiedAnalysis,
    prefilter_markers: &[String],
    links: &[(i64, f64)],
) -> Result<(), crate::error::QueueError> {
    let mut markers: Vec<String> = prefilter_markers.to_vec();
    markers.extend(analysis.ad_markers.iter().cloned());
    let markers_json = serde_json::to_string(&markers).unwrap_or_else(|_| "[]".to_string());

    let article_id = article.id;
    let optimized_title = analysis.optimized_title.clone();
    let summary = analysis.summary.clone();
    let is_ad = analysis.is_advertisement;
    let ad_confidence = analysis.ad_confidence;
    let ad_type = analysis.ad_type.as_str().to_string();
    let ad_reasoning = analysis.ad_reasoning.clone();
    let publication_date = analysis.publication_date;
    let links = links.to_vec();

    ctx.queue
        .write(
            "articles",
            Arc::new(move |conn| {
                let optimized_title = optimized_title.clone();
                let summary = summary.clone();
                let ad_type = ad_type.clone();
                let ad_reasoning = ad_reasoning.clone();
                let markers_json = markers_json.clone();
                let links = links.clone();
                Box::pin(async move {
                    store::apply_article_analysis(
                        &mut *conn,
                        article_id,
                        optimized_title.as_deref(),
                        summary.as_deref(),
                        is_ad,
                        ad_confidence,
                        &ad_type,
                        &ad_reasoning,
                        &markers_json,
                        publication_date,
                    )
                    .await?;
                    store::replace_article_categories(&mut *conn, article_id, &links).await?;
                    store::mark_category_processed(&mut *conn, article_id).await?;
                    Ok(())
                })
            }),
        )
        .await
}

#[async_trait]
impl TaskRunner for Orchestrator {
    async fn run(
        &self,
        task_name: &str,
        _task_config: serde_json::Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        match task_name {
            "news_digest" => {
                self.run_cycle(true, &cancel).await?;
                Ok(())
            }
            "news_processing" => {
                self.run_cycle(false, &cancel).await?;
                Ok(())
            }
            other => {
                warn!(task = other, "unknown task type");
                Ok(())
            }
        }
    }
}
