//! Per-domain extraction learning: which selectors work where, how stable
//! a domain is, and whether spending AI credits on it is justified.
//!
//! All writes go through the persistence queue on a per-domain shard, so
//! counter updates are serialized and stay consistent. Reads are served
//! from an in-process cache with bounded staleness.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::dbqueue::DbQueue;
use crate::error::QueueError;
use crate::models::{DomainStability, ExtractionPattern};
use crate::store;

const CACHE_STALENESS: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// 7-day success rate a domain needs to be considered stable.
    pub stability_threshold: f64,
    /// Consecutive successes a domain (and a pattern) needs for stability.
    pub stability_streak: i64,
    /// Consecutive failures before AI selector discovery becomes eligible.
    pub failure_threshold: i64,
    /// Cooldown between AI analyses of the same domain.
    pub ai_cooldown_days: i64,
    /// Hard cap on AI discovery calls per day across all domains.
    pub ai_daily_budget: i64,
    pub render_timeout_min_ms: i64,
    pub render_timeout_max_ms: i64,
    /// Cooldown after the first failed render of a domain; grows with the
    /// failure streak.
    pub render_cooldown_base_secs: i64,
    pub render_cooldown_max_secs: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stability_threshold: 0.8,
            stability_streak: 5,
            failure_threshold: 3,
            ai_cooldown_days: 7,
            ai_daily_budget: 10,
            render_timeout_min_ms: 5_000,
            render_timeout_max_ms: 60_000,
            render_cooldown_base_secs: 600,
            render_cooldown_max_secs: 21_600,
        }
    }
}

/// Exponential render cooldown: the base delay after the first failure,
/// growing by half per consecutive failure, capped. The streak itself is
/// capped so the delay stays finite.
pub fn render_backoff_secs(failures: i64, base_secs: i64, max_secs: i64) -> i64 {
    if failures <= 0 {
        return 0;
    }
    let mut delay = base_secs as f64;
    for _ in 1..failures.min(8) {
        delay *= 1.5;
    }
    (delay as i64).min(max_secs)
}

#[derive(Debug, Clone, Default)]
pub struct DomainSnapshot {
    pub patterns: Vec<ExtractionPattern>,
    pub stability: Option<DomainStability>,
}

impl DomainSnapshot {
    pub fn is_stable(&self) -> bool {
        self.stability.as_ref().map(|s| s.is_stable).unwrap_or(false)
    }

    pub fn needs_render(&self) -> bool {
        self.stability.as_ref().map(|s| s.needs_render).unwrap_or(false)
    }

    pub fn render_timeout_ms(&self) -> Option<i64> {
        self.stability.as_ref().map(|s| s.render_timeout_ms)
    }

    /// Best learned selectors, stable ones first.
    pub fn best_patterns(&self) -> impl Iterator<Item = &ExtractionPattern> {
        self.patterns.iter()
    }
}

#[derive(Debug, Clone)]
pub struct AttemptRecord<'a> {
    pub url: &'a str,
    pub domain: &'a str,
    pub strategy: &'a str,
    pub selector: Option<&'a str>,
    pub discovered_by: &'a str,
    pub success: bool,
    pub quality: f64,
    pub elapsed_ms: i64,
    pub error: Option<&'a str>,
    pub http_status: Option<i64>,
}

pub struct ExtractionMemory {
    queue: Arc<DbQueue>,
    config: MemoryConfig,
    cache: Mutex<HashMap<String, (Instant, DomainSnapshot)>>,
}

impl ExtractionMemory {
    pub fn new(queue: Arc<DbQueue>, config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Learned patterns and stability for a domain, ordered stable-first.
    /// Served from cache within the staleness bound.
    pub async fn lookup(&self, domain: &str) -> Result<DomainSnapshot, QueueError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((at, snapshot)) = cache.get(domain) {
                if at.elapsed() < CACHE_STALENESS {
                    return Ok(snapshot.clone());
                }
            }
        }

        let domain_owned = domain.to_string();
        let snapshot = self
            .queue
            .read(move |pool| {
                let domain = domain_owned.clone();
                Box::pin(async move {
                    let patterns = store::get_patterns_for_domain(&pool, &domain).await?;
                    let stability = store::get_domain_stability(&pool, &domain).await?;
                    Ok(DomainSnapshot { patterns, stability })
                })
            })
            .await?;

        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(domain.to_string(), (Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    pub fn invalidate(&self, domain: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(domain);
    }

    /// Record one extraction attempt: the raw attempt log row, the pattern
    /// counters (when a selector was used) and the domain stability
    /// aggregate, including the adaptive render timeout.
    pub async fn record_attempt(&self, attempt: AttemptRecord<'_>) -> Result<(), QueueError> {
        let previous = self.lookup(attempt.domain).await?.stability;

        let domain_owned = attempt.domain.to_string();
        let (rate_7d, rate_30d) = self
            .queue
            .read(move |pool| {
                let domain = domain_owned.clone();
                Box::pin(async move { store::rolling_success_rates(&pool, &domain).await })
            })
            .await?;

        // Fold this attempt into the rolling rate before it lands in the log.
        let prior_total = previous.as_ref().map(|s| s.total_attempts).unwrap_or(0);
        let window = (prior_total.min(50) + 1) as f64;
        let observed = if attempt.success { 1.0 } else { 0.0 };
        let rate_7d = (rate_7d * (window - 1.0) + observed) / window;
        let rate_30d = (rate_30d * (window - 1.0) + observed) / window;

        let streak = if attempt.success {
            previous.as_ref().map(|s| s.consecutive_successes).unwrap_or(0) + 1
        } else {
            0
        };
        let failures = if attempt.success {
            0
        } else {
            previous.as_ref().map(|s| s.consecutive_failures).unwrap_or(0) + 1
        };
        let was_stable = previous.as_ref().map(|s| s.is_stable).unwrap_or(false);
        let was_flagged = previous.as_ref().map(|s| s.needs_reanalysis).unwrap_or(false);

        let is_stable =
            rate_7d >= self.config.stability_threshold && streak >= self.config.stability_streak;
        // Two consecutive failures flag the domain for reanalysis; the flag
        // stays up until the domain stabilizes or an AI analysis clears it.
        let needs_reanalysis = !is_stable && (failures >= 2 || was_flagged);

        if is_stable && !was_stable {
            info!(domain = attempt.domain, rate_7d, streak, "domain marked stable");
        } else if was_stable && !is_stable {
            info!(domain = attempt.domain, failures, "stable domain regressed");
        }

        let render_timeout = self.adapt_render_timeout(previous.as_ref(), attempt.success);

        let domain = attempt.domain.to_string();
        let url = attempt.url.to_string();
        let strategy = attempt.strategy.to_string();
        let selector = attempt.selector.map(str::to_string);
        let discovered_by = attempt.discovered_by.to_string();
        let error = attempt.error.map(str::to_string);
        let success = attempt.success;
        let quality = attempt.quality;
        let elapsed_ms = attempt.elapsed_ms;
        let http_status = attempt.http_status;
        let stability_streak = self.config.stability_streak;

        let shard = format!("extraction:{}", attempt.domain);
        self.queue
            .write(
                &shard,
                Arc::new(move |conn| {
                    let domain = domain.clone();
                    let url = url.clone();
                    let strategy = strategy.clone();
                    let selector = selector.clone();
                    let discovered_by = discovered_by.clone();
                    let error = error.clone();
                    Box::pin(async move {
                        store::insert_extraction_attempt(
                            &mut *conn,
                            &url,
                            &domain,
                            &strategy,
                            selector.as_deref(),
                            success,
                            None,
                            Some(quality),
                            elapsed_ms,
                            error.as_deref(),
                            http_status,
                        )
                        .await?;
                        if let Some(ref sel) = selector {
                            store::upsert_pattern_attempt(
                                &mut *conn,
                                &domain,
                                sel,
                                &strategy,
                                &discovered_by,
                                success,
                                quality,
                                stability_streak,
                            )
                            .await?;
                        }
                        store::upsert_domain_stability(
                            &mut *conn,
                            &domain,
                            success,
                            rate_7d,
                            rate_30d,
                            is_stable,
                            needs_reanalysis,
                            render_timeout,
                        )
                        .await?;
                        Ok(())
                    })
                }),
            )
            .await?;

        self.invalidate(attempt.domain);
        Ok(())
    }

    /// Render timeout per domain grows with failures and shrinks with
    /// successes, inside the configured bounds.
    fn adapt_render_timeout(&self, previous: Option<&DomainStability>, success: bool) -> i64 {
        let current = previous
            .map(|s| s.render_timeout_ms)
            .unwrap_or((self.config.render_timeout_min_ms + self.config.render_timeout_max_ms) / 4);
        let adapted = if success {
            (current as f64 * 0.9) as i64
        } else {
            (current as f64 * 1.5) as i64
        };
        adapted.clamp(self.config.render_timeout_min_ms, self.config.render_timeout_max_ms)
    }

    /// AI selector discovery is allowed only for unstable domains that keep
    /// failing, past the per-domain cooldown, while daily budget remains.
    pub async fn should_invoke_ai(&self, domain: &str) -> Result<bool, QueueError> {
        let snapshot = self.lookup(domain).await?;
        let stability = match snapshot.stability {
            Some(s) => s,
            None => return Ok(false),
        };
        if stability.is_stable {
            return Ok(false);
        }
        if stability.consecutive_failures < self.config.failure_threshold {
            return Ok(false);
        }
        if let Some(last) = stability.last_ai_analysis {
            if Utc::now() - last < chrono::Duration::days(self.config.ai_cooldown_days) {
                return Ok(false);
            }
        }
        let used_today = self
            .queue
            .read(|pool| Box::pin(async move { store::ai_analyses_today(&pool).await }))
            .await?;
        Ok(used_today < self.config.ai_daily_budget)
    }

    /// A stable learned pattern answered without any expensive strategy;
    /// count the credit we did not spend.
    pub async fn note_credits_saved(&self, domain: &str) -> Result<(), QueueError> {
        let shard = format!("extraction:{domain}");
        let domain = domain.to_string();
        self.queue
            .write(
                &shard,
                Arc::new(move |conn| {
                    let domain = domain.clone();
                    Box::pin(async move { store::add_ai_credits_saved(conn, &domain).await })
                }),
            )
            .await
    }

    /// Store AI-discovered selectors as unproven patterns and log the
    /// analysis against the daily budget.
    pub async fn record_ai_discovery(
        &self,
        domain: &str,
        selectors: &[String],
        raw_result: &str,
    ) -> Result<(), QueueError> {
        debug!(domain, count = selectors.len(), "recording AI-discovered selectors");
        let shard = format!("extraction:{domain}");
        let domain_owned = domain.to_string();
        let selectors = selectors.to_vec();
        let raw = raw_result.to_string();
        self.queue
            .write(
                &shard,
                Arc::new(move |conn| {
                    let domain = domain_owned.clone();
                    let selectors = selectors.clone();
                    let raw = raw.clone();
                    Box::pin(async move {
                        store::record_ai_analysis(
                            &mut *conn,
                            &domain,
                            "selector_discovery",
                            &raw,
                            selectors.len() as i64,
                        )
                        .await?;
                        for selector in &selectors {
                            store::upsert_pattern_attempt(
                                &mut *conn,
                                &domain,
                                selector,
                                "css_selector",
                                "ai",
                                false,
                                0.0,
                                i64::MAX,
                            )
                            .await?;
                        }
                        Ok(())
                    })
                }),
            )
            .await?;
        self.invalidate(domain);
        Ok(())
    }

    /// Whether the domain's render budget allows another headless attempt.
    /// Exhausted while the cooldown from recent render failures is still
    /// running; a successful render resets it.
    pub async fn render_budget_available(&self, domain: &str) -> Result<bool, QueueError> {
        let snapshot = self.lookup(domain).await?;
        let Some(stability) = snapshot.stability else {
            return Ok(true);
        };
        if stability.render_failure_count == 0 {
            return Ok(true);
        }
        let Some(last_failure) = stability.last_render_failure_at else {
            return Ok(true);
        };
        let cooldown = chrono::Duration::seconds(render_backoff_secs(
            stability.render_failure_count,
            self.config.render_cooldown_base_secs,
            self.config.render_cooldown_max_secs,
        ));
        Ok(Utc::now() - last_failure >= cooldown)
    }

    /// Record a headless-render outcome for the domain's budget tracking.
    pub async fn record_render_outcome(&self, domain: &str, success: bool) -> Result<(), QueueError> {
        let shard = format!("extraction:{domain}");
        let domain_owned = domain.to_string();
        self.queue
            .write(
                &shard,
                Arc::new(move |conn| {
                    let domain = domain_owned.clone();
                    Box::pin(async move { store::record_render_outcome(conn, &domain, success).await })
                }),
            )
            .await?;
        self.invalidate(domain);
        Ok(())
    }

    pub async fn set_needs_render(&self, domain: &str, needs_render: bool) -> Result<(), QueueError> {
        let shard = format!("extraction:{domain}");
        let domain_owned = domain.to_string();
        self.queue
            .write(
                &shard,
                Arc::new(move |conn| {
                    let domain = domain_owned.clone();
                    Box::pin(async move {
                        store::set_domain_needs_render(conn, &domain, needs_render).await
                    })
                }),
            )
            .await?;
        self.invalidate(domain);
        Ok(())
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::dbqueue::QueueConfig;
    use crate::migrations::run_migrations;

    async fn memory() -> Arc<ExtractionMemory> {
        let pool = create_test_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let queue = DbQueue::new(pool, QueueConfig::default());
        ExtractionMemory::new(queue, MemoryConfig::default())
    }

    fn attempt<'a>(domain: &'a str, success: bool, selector: Option<&'a str>) -> AttemptRecord<'a> {
        AttemptRecord {
            url: "https://news.test/a",
            domain,
            strategy: "css_selector",
            selector,
            discovered_by: "heuristic",
            success,
            quality: if success { 0.8 } else { 0.0 },
            elapsed_ms: 120,
            error: None,
            http_status: Some(200),
        }
    }

    #[tokio::test]
    async fn domain_becomes_stable_after_streak() {
        let memory = memory().await;
        for _ in 0..5 {
            memory
                .record_attempt(attempt("news.test", true, Some(".article__text")))
                .await
                .unwrap();
        }
        let snapshot = memory.lookup("news.test").await.unwrap();
        assert!(snapshot.is_stable());
        let stability = snapshot.stability.unwrap();
        assert_eq!(stability.consecutive_successes, 5);
        assert!(stability.success_rate_7d >= 0.8);

        let patterns = snapshot.patterns;
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].is_stable);
        assert_eq!(patterns[0].success_count, 5);
    }

    #[tokio::test]
    async fn failures_reset_streak_and_flag_reanalysis() {
        let memory = memory().await;
        for _ in 0..5 {
            memory
                .record_attempt(attempt("flaky.test", true, Some(".content")))
                .await
                .unwrap();
        }
        assert!(memory.lookup("flaky.test").await.unwrap().is_stable());

        for _ in 0..2 {
            memory
                .record_attempt(attempt("flaky.test", false, Some(".content")))
                .await
                .unwrap();
        }
        let snapshot = memory.lookup("flaky.test").await.unwrap();
        let stability = snapshot.stability.unwrap();
        assert!(!stability.is_stable);
        assert_eq!(stability.consecutive_failures, 2);
        assert!(stability.needs_reanalysis);
    }

    #[tokio::test]
    async fn ai_gating_requires_failure_streak_and_budget() {
        let memory = memory().await;
        assert!(!memory.should_invoke_ai("unknown.test").await.unwrap());

        for _ in 0..3 {
            memory
                .record_attempt(attempt("hard.test", false, None))
                .await
                .unwrap();
        }
        assert!(memory.should_invoke_ai("hard.test").await.unwrap());

        // Recording an analysis starts the cooldown.
        memory
            .record_ai_discovery("hard.test", &[".main".to_string()], "{}")
            .await
            .unwrap();
        assert!(!memory.should_invoke_ai("hard.test").await.unwrap());
    }

    #[tokio::test]
    async fn render_timeout_adapts_within_bounds() {
        let memory = memory().await;
        for _ in 0..20 {
            memory
                .record_attempt(attempt("slow.test", false, None))
                .await
                .unwrap();
        }
        let timeout = memory
            .lookup("slow.test")
            .await
            .unwrap()
            .render_timeout_ms()
            .unwrap();
        assert_eq!(timeout, memory.config().render_timeout_max_ms);

        for _ in 0..60 {
            memory
                .record_attempt(attempt("slow.test", true, None))
                .await
                .unwrap();
        }
        let timeout = memory
            .lookup("slow.test")
            .await
            .unwrap()
            .render_timeout_ms()
            .unwrap();
        assert_eq!(timeout, memory.config().render_timeout_min_ms);
    }

    #[test]
    fn render_backoff_grows_with_the_streak_and_stays_capped() {
        assert_eq!(render_backoff_secs(0, 600, 21_600), 0);
        assert_eq!(render_backoff_secs(1, 600, 21_600), 600);
        assert_eq!(render_backoff_secs(2, 600, 21_600), 900);
        assert!(render_backoff_secs(3, 600, 21_600) > render_backoff_secs(2, 600, 21_600));
        // The streak is capped, so the delay stops growing.
        assert_eq!(
            render_backoff_secs(50, 600, 21_600),
            render_backoff_secs(8, 600, 21_600)
        );
        assert!(render_backoff_secs(8, 600, 21_600) <= 21_600);
        assert_eq!(render_backoff_secs(8, 600, 700), 700);
    }

    #[tokio::test]
    async fn render_failures_exhaust_the_budget_until_a_success() {
        let memory = memory().await;
        assert!(memory.render_budget_available("js.test").await.unwrap());

        memory.record_render_outcome("js.test", false).await.unwrap();
        assert!(
            !memory.render_budget_available("js.test").await.unwrap(),
            "a fresh failure must start the cooldown"
        );
        let stability = memory.lookup("js.test").await.unwrap().stability.unwrap();
        assert_eq!(stability.render_failure_count, 1);
        assert!(stability.last_render_failure_at.is_some());

        memory.record_render_outcome("js.test", false).await.unwrap();
        let stability = memory.lookup("js.test").await.unwrap().stability.unwrap();
        assert_eq!(stability.render_failure_count, 2);

        memory.record_render_outcome("js.test", true).await.unwrap();
        assert!(memory.render_budget_available("js.test").await.unwrap());
        let stability = memory.lookup("js.test").await.unwrap().stability.unwrap();
        assert_eq!(stability.render_failure_count, 0);
        assert!(stability.last_render_failure_at.is_none());
    }

    #[tokio::test]
    async fn credits_saved_accumulate() {
        let memory = memory().await;
        memory
            .record_attempt(attempt("saved.test", true, Some(".a")))
            .await
            .unwrap();
        memory.note_credits_saved("saved.test").await.unwrap();
        memory.note_credits_saved("saved.test").await.unwrap();
        memory.invalidate("saved.test");
        let snapshot = memory.lookup("saved.test").await.unwrap();
        assert_eq!(snapshot.stability.unwrap().ai_credits_saved, 2);
    }
}
