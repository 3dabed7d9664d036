//! SQL units over the schema. Write helpers take `&mut SqliteConnection`
//! so the persistence queue can run them inside its serialized, retried
//! transactions; read helpers take the pool directly.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::models::{
    Article, CandidateArticle, Category, CategoryMapping, DailySummary, DomainStability,
    ExtractionPattern, ProcessingStat, QueuedTask, ScheduleSetting, Source,
};

const SOURCE_COLUMNS: &str = "id, name, source_type, url, enabled, config, fetch_interval,
    last_fetch, last_success, last_error, error_count";

const ARTICLE_COLUMNS: &str = "id, source_id, title, optimized_title, url, content, summary,
    published_at, fetched_at, summary_processed, category_processed, ad_processed, hash_content,
    is_advertisement, ad_confidence, ad_type, ad_reasoning, ad_markers, media_files";

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub async fn upsert_source(
    conn: &mut SqliteConnection,
    name: &str,
    source_type: &str,
    url: &str,
    config: &str,
    fetch_interval: i64,
    enabled: bool,
) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "INSERT INTO sources (name, source_type, url, config, fetch_interval, enabled)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(name, url) DO UPDATE SET
            source_type = excluded.source_type,
            config = excluded.config,
            fetch_interval = excluded.fetch_interval,
            enabled = excluded.enabled,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(name)
    .bind(source_type)
    .bind(url)
    .bind(config)
    .bind(fetch_interval)
    .bind(enabled)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT id FROM sources WHERE name = ? AND url = ?")
        .bind(name)
        .bind(url)
        .fetch_one(conn)
        .await?;
    Ok(row.get::<i64, _>("id"))
}

pub async fn get_enabled_sources(pool: &SqlitePool) -> Result<Vec<Source>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {SOURCE_COLUMNS} FROM sources WHERE enabled = 1 ORDER BY id"
    ))
    .fetch_all(pool)
    .await
}

pub async fn get_source(pool: &SqlitePool, id: i64) -> Result<Option<Source>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Success resets the error streak.
pub async fn record_source_success(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sources SET last_fetch = ?, last_success = ?, last_error = NULL, error_count = 0,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Failure bumps the streak; past the threshold the source is soft-disabled
/// (it keeps its rows and can be re-enabled by the admin).
pub async fn record_source_failure(
    conn: &mut SqliteConnection,
    id: i64,
    error: &str,
    disable_threshold: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sources SET last_fetch = ?, last_error = ?, error_count = error_count + 1,
         enabled = CASE WHEN error_count + 1 >= ? THEN 0 ELSE enabled END,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(error)
    .bind(disable_threshold)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Articles
// ---------------------------------------------------------------------------

/// Insert a candidate if its URL is new. Duplicate URLs are a no-op at the
/// unique constraint, not an error. Returns the article id and whether a
/// row was actually inserted.
pub async fn upsert_article(
    conn: &mut SqliteConnection,
    source_id: i64,
    candidate: &CandidateArticle,
    hash_content: &str,
) -> Result<(i64, bool), sqlx::Error> {
    let now = Utc::now();
    // published_at must never exceed fetched_at by more than the skew
    // tolerance; clock-skewed feeds are clamped to now.
    let published_at = match candidate.published_at {
        Some(p) if p <= now + Duration::hours(24) => p,
        Some(_) => now,
        None => now,
    };
    let media = serde_json::to_string(&candidate.media_files).unwrap_or_else(|_| "[]".to_string());

    let result = sqlx::query(
        "INSERT INTO articles (source_id, title, url, content, published_at, fetched_at, hash_content, media_files)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(url) DO NOTHING",
    )
    .bind(source_id)
    .bind(&candidate.title)
    .bind(&candidate.url)
    .bind(&candidate.content)
    .bind(published_at)
    .bind(now)
    .bind(hash_content)
    .bind(media)
    .execute(&mut *conn)
    .await?;

    let inserted = result.rows_affected() > 0;
    let row = sqlx::query("SELECT id FROM articles WHERE url = ?")
        .bind(&candidate.url)
        .fetch_one(conn)
        .await?;
    let id = row.get::<i64, _>("id");
    if inserted {
        debug!(article_id = id, url = %candidate.url, "article inserted");
    }
    Ok((id, inserted))
}

pub async fn get_article(pool: &SqlitePool, id: i64) -> Result<Option<Article>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Articles still waiting for any stage of AI processing.
pub async fn get_unprocessed_articles(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<Article>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles
         WHERE summary_processed = 0 OR category_processed = 0 OR ad_processed = 0
         ORDER BY fetched_at ASC
         LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn hash_seen(pool: &SqlitePool, hash: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM articles WHERE hash_content = ? LIMIT 1")
        .bind(hash)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn set_article_content(
    conn: &mut SqliteConnection,
    id: i64,
    content: &str,
    hash_content: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE articles SET content = ?, hash_content = ? WHERE id = ?")
        .bind(content)
        .bind(hash_content)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn backfill_article_media(
    conn: &mut SqliteConnection,
    id: i64,
    media_json: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE articles SET media_files = ? WHERE id = ?")
        .bind(media_json)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Persist the unified AI result. Processed flags only ever move
/// false → true here.
#[allow(clippy::too_many_arguments)]
pub async fn apply_article_analysis(
    conn: &mut SqliteConnection,
    id: i64,
    optimized_title: Option<&str>,
    summary: Option<&str>,
    is_advertisement: bool,
    ad_confidence: f64,
    ad_type: &str,
    ad_reasoning: &str,
    ad_markers_json: &str,
    publication_date: Option<NaiveDate>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE articles SET
            optimized_title = COALESCE(?, optimized_title),
            summary = COALESCE(?, summary),
            summary_processed = 1,
            ad_processed = 1,
            is_advertisement = ?,
            ad_confidence = ?,
            ad_type = ?,
            ad_reasoning = ?,
            ad_markers = ?,
            published_at = CASE
                WHEN ? IS NOT NULL AND ? <= fetched_at THEN ?
                ELSE published_at
            END
         WHERE id = ?",
    )
    .bind(optimized_title)
    .bind(summary)
    .bind(is_advertisement)
    .bind(ad_confidence)
    .bind(ad_type)
    .bind(ad_reasoning)
    .bind(ad_markers_json)
    .bind(publication_date.map(|d| d.and_hms_opt(0, 0, 0).map(|t| t.and_utc())).flatten())
    .bind(publication_date.map(|d| d.and_hms_opt(0, 0, 0).map(|t| t.and_utc())).flatten())
    .bind(publication_date.map(|d| d.and_hms_opt(0, 0, 0).map(|t| t.and_utc())).flatten())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn mark_category_processed(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE articles SET category_processed = 1 WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Processed articles of a calendar day, joined with their category names.
pub async fn get_articles_for_date(
    pool: &SqlitePool,
    date: NaiveDate,
) -> Result<Vec<(Article, Vec<String>)>, sqlx::Error> {
    let articles: Vec<Article> = sqlx::query_as(&format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles
         WHERE date(published_at) = ? AND summary_processed = 1 AND category_processed = 1
         ORDER BY published_at DESC"
    ))
    .bind(date.format("%Y-%m-%d").to_string())
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(articles.len());
    for article in articles {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT c.name FROM article_categories ac
             JOIN categories c ON c.id = ac.category_id
             WHERE ac.article_id = ?
             ORDER BY ac.confidence DESC",
        )
        .bind(article.id)
        .fetch_all(pool)
        .await?;
        out.push((article, names.into_iter().map(|n| n.0).collect()));
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct FeedParams {
    pub category: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub since_hours: Option<i64>,
    pub hide_ads: bool,
}

pub async fn feed_articles(
    pool: &SqlitePool,
    params: &FeedParams,
) -> Result<Vec<Article>, sqlx::Error> {
    let mut sql = format!(
        "SELECT DISTINCT a.id, a.source_id, a.title, a.optimized_title, a.url, a.content, a.summary,
            a.published_at, a.fetched_at, a.summary_processed, a.category_processed, a.ad_processed,
            a.hash_content, a.is_advertisement, a.ad_confidence, a.ad_type, a.ad_reasoning,
            a.ad_markers, a.media_files
         FROM articles a"
    );
    if params.category.is_some() {
        sql.push_str(
            " JOIN article_categories ac ON ac.article_id = a.id
              JOIN categories c ON c.id = ac.category_id",
        );
    }
    sql.push_str(" WHERE 1 = 1");
    if params.category.is_some() {
        sql.push_str(" AND c.name = ?");
    }
    if params.since_hours.is_some() {
        sql.push_str(" AND a.published_at >= ?");
    }
    if params.hide_ads {
        sql.push_str(" AND a.is_advertisement = 0");
    }
    sql.push_str(" ORDER BY a.published_at DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, Article>(&sql);
    if let Some(ref category) = params.category {
        query = query.bind(category.clone());
    }
    if let Some(hours) = params.since_hours {
        query = query.bind(Utc::now() - Duration::hours(hours));
    }
    query = query.bind(params.limit.max(1)).bind(params.offset.max(0));
    query.fetch_all(pool).await
}

pub async fn search_articles(
    pool: &SqlitePool,
    q: &str,
    category: Option<&str>,
    since_hours: Option<i64>,
    limit: i64,
) -> Result<Vec<Article>, sqlx::Error> {
    let pattern = format!("%{}%", q.replace('%', "\\%").replace('_', "\\_"));
    let mut sql = format!(
        "SELECT DISTINCT a.id, a.source_id, a.title, a.optimized_title, a.url, a.content, a.summary,
            a.published_at, a.fetched_at, a.summary_processed, a.category_processed, a.ad_processed,
            a.hash_content, a.is_advertisement, a.ad_confidence, a.ad_type, a.ad_reasoning,
            a.ad_markers, a.media_files
         FROM articles a"
    );
    if category.is_some() {
        sql.push_str(
            " JOIN article_categories ac ON ac.article_id = a.id
              JOIN categories c ON c.id = ac.category_id",
        );
    }
    sql.push_str(
        " WHERE (a.title LIKE ? ESCAPE '\\' OR a.summary LIKE ? ESCAPE '\\' OR a.content LIKE ? ESCAPE '\\')",
    );
    if category.is_some() {
        sql.push_str(" AND c.name = ?");
    }
    if since_hours.is_some() {
        sql.push_str(" AND a.published_at >= ?");
    }
    sql.push_str(" ORDER BY a.published_at DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, Article>(&sql)
        .bind(pattern.clone())
        .bind(pattern.clone())
        .bind(pattern);
    if let Some(cat) = category {
        query = query.bind(cat.to_string());
    }
    if let Some(hours) = since_hours {
        query = query.bind(Utc::now() - Duration::hours(hours));
    }
    query = query.bind(limit.max(1));
    query.fetch_all(pool).await
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Seed the fixed taxonomy from configuration; existing rows keep their
/// display metadata.
pub async fn sync_categories(
    conn: &mut SqliteConnection,
    names: &[String],
) -> Result<(), sqlx::Error> {
    for name in names {
        sqlx::query(
            "INSERT INTO categories (name, display_name) VALUES (?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn get_categories(pool: &SqlitePool) -> Result<Vec<Category>, sqlx::Error> {
    sqlx::query_as("SELECT id, name, display_name, color, description FROM categories ORDER BY name")
        .fetch_all(pool)
        .await
}

pub async fn get_category_by_name(
    pool: &SqlitePool,
    name: &str,
) -> Result<Option<Category>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, name, display_name, color, description FROM categories WHERE name = ? COLLATE NOCASE",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
}

pub async fn category_counts(pool: &SqlitePool) -> Result<Vec<(Category, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT c.id, c.name, c.display_name, c.color, c.description,
                COUNT(ac.article_id) AS article_count
         FROM categories c
         LEFT JOIN article_categories ac ON ac.category_id = c.id
         GROUP BY c.id
         ORDER BY c.name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            (
                Category {
                    id: row.get("id"),
                    name: row.get("name"),
                    display_name: row.get("display_name"),
                    color: row.get("color"),
                    description: row.get("description"),
                },
                row.get::<i64, _>("article_count"),
            )
        })
        .collect())
}

/// Replace an article's category links in one unit. Runs under the queue's
/// transaction, so the invariant "every processed article has at least one
/// link" holds at commit.
pub async fn replace_article_categories(
    conn: &mut SqliteConnection,
    article_id: i64,
    links: &[(i64, f64)],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM article_categories WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    for (category_id, confidence) in links {
        sqlx::query(
            "INSERT INTO article_categories (article_id, category_id, confidence)
             VALUES (?, ?, ?)
             ON CONFLICT(article_id, category_id) DO UPDATE SET confidence = excluded.confidence",
        )
        .bind(article_id)
        .bind(category_id)
        .bind(confidence)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Category mappings
// ---------------------------------------------------------------------------

pub async fn get_active_mappings(pool: &SqlitePool) -> Result<Vec<CategoryMapping>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, ai_category, fixed_category, confidence_threshold, is_active, usage_count, last_used
         FROM category_mapping WHERE is_active = 1",
    )
    .fetch_all(pool)
    .await
}

pub async fn touch_mapping_usage(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE category_mapping SET usage_count = usage_count + 1, last_used = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Record an AI label with no mapping so the admin can review it later.
/// Stored inactive; resolution keeps falling back to the default category
/// until someone promotes the row.
pub async fn record_unmapped_label(
    conn: &mut SqliteConnection,
    label: &str,
    default_category: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO category_mapping (ai_category, fixed_category, is_active, description)
         VALUES (?, ?, 0, 'recorded automatically for review')
         ON CONFLICT(ai_category) DO UPDATE SET usage_count = category_mapping.usage_count + 1",
    )
    .bind(label)
    .bind(default_category)
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Extraction memory
// ---------------------------------------------------------------------------

pub async fn get_patterns_for_domain(
    pool: &SqlitePool,
    domain: &str,
) -> Result<Vec<ExtractionPattern>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, domain, selector_pattern, extraction_strategy, success_count, failure_count,
                quality_score_avg, discovered_by, is_stable, consecutive_successes, consecutive_failures
         FROM extraction_patterns
         WHERE domain = ?
         ORDER BY is_stable DESC,
                  CAST(success_count AS REAL) / MAX(success_count + failure_count, 1) DESC,
                  success_count DESC",
    )
    .bind(domain)
    .fetch_all(pool)
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_pattern_attempt(
    conn: &mut SqliteConnection,
    domain: &str,
    selector: &str,
    strategy: &str,
    discovered_by: &str,
    success: bool,
    quality: f64,
    stability_streak: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO extraction_patterns
            (domain, selector_pattern, extraction_strategy, discovered_by,
             success_count, failure_count, quality_score_avg,
             consecutive_successes, consecutive_failures,
             first_success_at, last_success_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(domain, selector_pattern, extraction_strategy) DO UPDATE SET
            success_count = success_count + excluded.success_count,
            failure_count = failure_count + excluded.failure_count,
            quality_score_avg = CASE WHEN excluded.success_count > 0
                THEN (quality_score_avg * success_count + excluded.quality_score_avg)
                     / (success_count + 1)
                ELSE quality_score_avg END,
            consecutive_successes = CASE WHEN excluded.success_count > 0
                THEN consecutive_successes + 1 ELSE 0 END,
            consecutive_failures = CASE WHEN excluded.failure_count > 0
                THEN consecutive_failures + 1 ELSE 0 END,
            is_stable = CASE WHEN excluded.success_count > 0
                THEN (consecutive_successes + 1 >= ?) ELSE 0 END,
            first_success_at = COALESCE(first_success_at, excluded.first_success_at),
            last_success_at = COALESCE(excluded.last_success_at, last_success_at),
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(domain)
    .bind(selector)
    .bind(strategy)
    .bind(discovered_by)
    .bind(if success { 1i64 } else { 0 })
    .bind(if success { 0i64 } else { 1 })
    .bind(if success { quality } else { 0.0 })
    .bind(if success { 1i64 } else { 0 })
    .bind(if success { 0i64 } else { 1 })
    .bind(if success { Some(Utc::now()) } else { None })
    .bind(if success { Some(Utc::now()) } else { None })
    .bind(stability_streak)
    .execute(conn)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_extraction_attempt(
    conn: &mut SqliteConnection,
    article_url: &str,
    domain: &str,
    strategy: &str,
    selector: Option<&str>,
    success: bool,
    content_length: Option<i64>,
    quality: Option<f64>,
    elapsed_ms: i64,
    error: Option<&str>,
    http_status: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO extraction_attempts
            (article_url, domain, extraction_strategy, selector_used, success,
             content_length, quality_score, extraction_time_ms, error_message, http_status_code)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(article_url)
    .bind(domain)
    .bind(strategy)
    .bind(selector)
    .bind(success)
    .bind(content_length)
    .bind(quality)
    .bind(elapsed_ms)
    .bind(error)
    .bind(http_status)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_domain_stability(
    pool: &SqlitePool,
    domain: &str,
) -> Result<Option<DomainStability>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, domain, is_stable, success_rate_7d, success_rate_30d, total_attempts,
                successful_attempts, consecutive_successes, consecutive_failures, last_ai_analysis,
                needs_reanalysis, needs_render, render_timeout_ms, render_failure_count,
                last_render_failure_at, ai_credits_saved
         FROM domain_stability WHERE domain = ?",
    )
    .bind(domain)
    .fetch_optional(pool)
    .await
}

/// Track headless-render outcomes per domain. A success clears the streak;
/// a failure bumps it and stamps the time, feeding the render cooldown.
pub async fn record_render_outcome(
    conn: &mut SqliteConnection,
    domain: &str,
    success: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO domain_stability (domain, render_failure_count, last_render_failure_at)
         VALUES (?, ?, ?)
         ON CONFLICT(domain) DO UPDATE SET
            render_failure_count = CASE WHEN excluded.render_failure_count > 0
                THEN render_failure_count + 1 ELSE 0 END,
            last_render_failure_at = CASE WHEN excluded.render_failure_count > 0
                THEN excluded.last_render_failure_at ELSE NULL END,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(domain)
    .bind(if success { 0i64 } else { 1 })
    .bind(if success { None } else { Some(Utc::now()) })
    .execute(conn)
    .await?;
    Ok(())
}

/// Rolling success rates computed from the attempt log.
pub async fn rolling_success_rates(
    pool: &SqlitePool,
    domain: &str,
) -> Result<(f64, f64), sqlx::Error> {
    let row = sqlx::query(
        "SELECT
            COALESCE(AVG(CASE WHEN created_at >= ? THEN CAST(success AS REAL) END), 0) AS rate_7d,
            COALESCE(AVG(CAST(success AS REAL)), 0) AS rate_30d
         FROM extraction_attempts
         WHERE domain = ? AND created_at >= ?",
    )
    .bind(Utc::now() - Duration::days(7))
    .bind(domain)
    .bind(Utc::now() - Duration::days(30))
    .fetch_one(pool)
    .await?;
    Ok((row.get::<f64, _>("rate_7d"), row.get::<f64, _>("rate_30d")))
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_domain_stability(
    conn: &mut SqliteConnection,
    domain: &str,
    success: bool,
    rate_7d: f64,
    rate_30d: f64,
    is_stable: bool,
    needs_reanalysis: bool,
    render_timeout_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO domain_stability
            (domain, is_stable, success_rate_7d, success_rate_30d, total_attempts,
             successful_attempts, consecutive_successes, consecutive_failures,
             last_successful_extraction, last_failed_extraction, needs_reanalysis, render_timeout_ms)
         VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(domain) DO UPDATE SET
            is_stable = excluded.is_stable,
            success_rate_7d = excluded.success_rate_7d,
            success_rate_30d = excluded.success_rate_30d,
            total_attempts = total_attempts + 1,
            successful_attempts = successful_attempts + excluded.successful_attempts,
            consecutive_successes = CASE WHEN excluded.successful_attempts > 0
                THEN consecutive_successes + 1 ELSE 0 END,
            consecutive_failures = CASE WHEN excluded.successful_attempts > 0
                THEN 0 ELSE consecutive_failures + 1 END,
            last_successful_extraction = COALESCE(excluded.last_successful_extraction, last_successful_extraction),
            last_failed_extraction = COALESCE(excluded.last_failed_extraction, last_failed_extraction),
            needs_reanalysis = excluded.needs_reanalysis,
            render_timeout_ms = excluded.render_timeout_ms,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(domain)
    .bind(is_stable)
    .bind(rate_7d)
    .bind(rate_30d)
    .bind(if success { 1i64 } else { 0 })
    .bind(if success { 1i64 } else { 0 })
    .bind(if success { 0i64 } else { 1 })
    .bind(if success { Some(Utc::now()) } else { None })
    .bind(if success { None } else { Some(Utc::now()) })
    .bind(needs_reanalysis)
    .bind(render_timeout_ms)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn set_domain_needs_render(
    conn: &mut SqliteConnection,
    domain: &str,
    needs_render: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO domain_stability (domain, needs_render) VALUES (?, ?)
         ON CONFLICT(domain) DO UPDATE SET needs_render = excluded.needs_render,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(domain)
    .bind(needs_render)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn add_ai_credits_saved(
    conn: &mut SqliteConnection,
    domain: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE domain_stability SET ai_credits_saved = ai_credits_saved + 1,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE domain = ?",
    )
    .bind(domain)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn record_ai_analysis(
    conn: &mut SqliteConnection,
    domain: &str,
    analysis_type: &str,
    result_json: &str,
    patterns_discovered: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ai_usage_tracking (domain, analysis_type, analysis_result, patterns_discovered)
         VALUES (?, ?, ?, ?)",
    )
    .bind(domain)
    .bind(analysis_type)
    .bind(result_json)
    .bind(patterns_discovered)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE domain_stability SET last_ai_analysis = ?, needs_reanalysis = 0,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE domain = ?",
    )
    .bind(Utc::now())
    .bind(domain)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn ai_analyses_today(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS c FROM ai_usage_tracking WHERE date(created_at) = date('now')",
    )
    .fetch_one(pool)
    .await?;
    Ok(row.get::<i64, _>("c"))
}

// ---------------------------------------------------------------------------
// Schedule settings
// ---------------------------------------------------------------------------

const SCHEDULE_COLUMNS: &str = "id, task_name, enabled, schedule_type, hour, minute, weekdays,
    timezone, last_run, next_run, is_running, task_config";

pub async fn get_schedule_settings(pool: &SqlitePool) -> Result<Vec<ScheduleSetting>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedule_settings ORDER BY task_name"
    ))
    .fetch_all(pool)
    .await
}

pub async fn get_enabled_schedule_settings(
    pool: &SqlitePool,
) -> Result<Vec<ScheduleSetting>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedule_settings WHERE enabled = 1"
    ))
    .fetch_all(pool)
    .await
}

pub async fn get_schedule_setting(
    pool: &SqlitePool,
    task_name: &str,
) -> Result<Option<ScheduleSetting>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedule_settings WHERE task_name = ?"
    ))
    .bind(task_name)
    .fetch_optional(pool)
    .await
}

pub async fn seed_default_tasks(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for (task, hour) in [("news_processing", 7i64), ("news_digest", 20i64)] {
        sqlx::query(
            "INSERT INTO schedule_settings (task_name, enabled, schedule_type, hour, minute)
             VALUES (?, 0, 'daily', ?, 0)
             ON CONFLICT(task_name) DO NOTHING",
        )
        .bind(task)
        .bind(hour)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn update_schedule_setting(
    conn: &mut SqliteConnection,
    task_name: &str,
    enabled: bool,
    schedule_type: &str,
    hour: i64,
    minute: i64,
    weekdays_json: &str,
    timezone: &str,
    task_config_json: &str,
    next_run: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO schedule_settings
            (task_name, enabled, schedule_type, hour, minute, weekdays, timezone, task_config, next_run)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(task_name) DO UPDATE SET
            enabled = excluded.enabled,
            schedule_type = excluded.schedule_type,
            hour = excluded.hour,
            minute = excluded.minute,
            weekdays = excluded.weekdays,
            timezone = excluded.timezone,
            task_config = excluded.task_config,
            next_run = excluded.next_run,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(task_name)
    .bind(enabled)
    .bind(schedule_type)
    .bind(hour)
    .bind(minute)
    .bind(weekdays_json)
    .bind(timezone)
    .bind(task_config_json)
    .bind(next_run)
    .execute(conn)
    .await?;
    Ok(())
}

/// Claim the task for a run; returns false when it was already running.
pub async fn mark_task_running(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE schedule_settings SET is_running = 1, last_run = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE id = ? AND is_running = 0",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Completion always clears is_running, success or not.
pub async fn finish_task(
    conn: &mut SqliteConnection,
    id: i64,
    next_run: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE schedule_settings SET is_running = 0, next_run = ?,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
    )
    .bind(next_run)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Force-clear tasks stuck in is_running past the deadline. Returns how
/// many rows were cleared.
pub async fn clear_stuck_tasks(
    conn: &mut SqliteConnection,
    stuck_before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE schedule_settings SET is_running = 0,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
         WHERE is_running = 1 AND last_run IS NOT NULL AND last_run < ?",
    )
    .bind(stuck_before)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Daily summaries, stats, settings, task queue
// ---------------------------------------------------------------------------

/// Same-day re-runs overwrite the stored summary.
pub async fn upsert_daily_summary(
    conn: &mut SqliteConnection,
    date: NaiveDate,
    category: &str,
    summary_text: &str,
    articles_count: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO daily_summaries (date, category, summary_text, articles_count)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(date, category) DO UPDATE SET
            summary_text = excluded.summary_text,
            articles_count = excluded.articles_count,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(date.format("%Y-%m-%d").to_string())
    .bind(category)
    .bind(summary_text)
    .bind(articles_count)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_daily_summaries(
    pool: &SqlitePool,
    date: NaiveDate,
) -> Result<Vec<DailySummary>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, date, category, summary_text, articles_count
         FROM daily_summaries WHERE date = ? ORDER BY category",
    )
    .bind(date.format("%Y-%m-%d").to_string())
    .fetch_all(pool)
    .await
}

pub async fn bump_processing_stats(
    conn: &mut SqliteConnection,
    date: NaiveDate,
    fetched: i64,
    processed: i64,
    api_calls: i64,
    errors: i64,
    seconds: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO processing_stats
            (date, articles_fetched, articles_processed, api_calls_made, errors_count, processing_time_seconds)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(date) DO UPDATE SET
            articles_fetched = articles_fetched + excluded.articles_fetched,
            articles_processed = articles_processed + excluded.articles_processed,
            api_calls_made = api_calls_made + excluded.api_calls_made,
            errors_count = errors_count + excluded.errors_count,
            processing_time_seconds = processing_time_seconds + excluded.processing_time_seconds",
    )
    .bind(date.format("%Y-%m-%d").to_string())
    .bind(fetched)
    .bind(processed)
    .bind(api_calls)
    .bind(errors)
    .bind(seconds)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_processing_stats(
    pool: &SqlitePool,
    days: i64,
) -> Result<Vec<ProcessingStat>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, date, articles_fetched, articles_processed, api_calls_made, errors_count,
                processing_time_seconds
         FROM processing_stats WHERE date >= ? ORDER BY date DESC",
    )
    .bind((Utc::now().date_naive() - Duration::days(days)).format("%Y-%m-%d").to_string())
    .fetch_all(pool)
    .await
}

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
}

pub async fn set_setting(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value,
         updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(key)
    .bind(value)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn enqueue_task(
    conn: &mut SqliteConnection,
    task_type: &str,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO task_queue (task_type) VALUES (?)")
        .bind(task_type)
        .execute(conn)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn claim_pending_task(
    conn: &mut SqliteConnection,
) -> Result<Option<QueuedTask>, sqlx::Error> {
    let task: Option<QueuedTask> = sqlx::query_as(
        "SELECT id, task_type, status, attempts, error_message
         FROM task_queue WHERE status = 'pending' ORDER BY id LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(ref t) = task {
        sqlx::query(
            "UPDATE task_queue SET status = 'running', attempts = attempts + 1, started_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(t.id)
        .execute(conn)
        .await?;
    }
    Ok(task)
}

pub async fn complete_task(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE task_queue SET status = 'completed', completed_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fail_task(
    conn: &mut SqliteConnection,
    id: i64,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE task_queue SET
            status = CASE WHEN attempts >= max_attempts THEN 'error' ELSE 'pending' END,
            completed_at = ?, error_message = ?
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(error)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_task(pool: &SqlitePool, id: i64) -> Result<Option<QueuedTask>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, task_type, status, attempts, error_message FROM task_queue WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::migrations::run_migrations;
    use crate::models::MediaFile;

    async fn pool_with_schema() -> SqlitePool {
        let pool = create_test_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn candidate(url: &str) -> CandidateArticle {
        CandidateArticle {
            title: "Hello".into(),
            url: url.into(),
            content: "Тело статьи достаточно длинное для теста.".into(),
            published_at: Some(Utc::now() - Duration::hours(1)),
            media_files: Vec::<MediaFile>::new(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn duplicate_url_is_noop() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let source_id = upsert_source(&mut conn, "feed", "rss", "https://x.test/rss", "{}", 1800, true)
            .await
            .unwrap();

        let (id1, inserted1) = upsert_article(&mut conn, source_id, &candidate("https://x.test/a"), "h1")
            .await
            .unwrap();
        let (id2, inserted2) = upsert_article(&mut conn, source_id, &candidate("https://x.test/a"), "h1")
            .await
            .unwrap();
        assert!(inserted1);
        assert!(!inserted2);
        assert_eq!(id1, id2);

        drop(conn);
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn future_published_at_is_clamped() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let source_id = upsert_source(&mut conn, "feed", "rss", "https://x.test/rss", "{}", 1800, true)
            .await
            .unwrap();
        let mut c = candidate("https://x.test/future");
        c.published_at = Some(Utc::now() + Duration::days(30));
        let (id, _) = upsert_article(&mut conn, source_id, &c, "h2").await.unwrap();
        drop(conn);
        let article = get_article(&pool, id).await.unwrap().unwrap();
        assert!(article.published_at <= article.fetched_at + Duration::hours(24));
    }

    #[tokio::test]
    async fn source_error_count_resets_on_success() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let id = upsert_source(&mut conn, "feed", "rss", "https://x.test/rss", "{}", 1800, true)
            .await
            .unwrap();
        record_source_failure(&mut conn, id, "boom", 10).await.unwrap();
        record_source_failure(&mut conn, id, "boom", 10).await.unwrap();
        drop(conn);
        let source = get_source(&pool, id).await.unwrap().unwrap();
        assert_eq!(source.error_count, 2);

        let mut conn = pool.acquire().await.unwrap();
        record_source_success(&mut conn, id).await.unwrap();
        drop(conn);
        let source = get_source(&pool, id).await.unwrap().unwrap();
        assert_eq!(source.error_count, 0);
        assert!(source.last_error.is_none());
    }

    #[tokio::test]
    async fn source_soft_disables_past_threshold() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let id = upsert_source(&mut conn, "feed", "rss", "https://x.test/rss", "{}", 1800, true)
            .await
            .unwrap();
        for _ in 0..3 {
            record_source_failure(&mut conn, id, "boom", 3).await.unwrap();
        }
        drop(conn);
        let source = get_source(&pool, id).await.unwrap().unwrap();
        assert!(!source.enabled);
    }

    #[tokio::test]
    async fn article_categories_are_unique_per_pair() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let source_id = upsert_source(&mut conn, "feed", "rss", "https://x.test/rss", "{}", 1800, true)
            .await
            .unwrap();
        let (article_id, _) = upsert_article(&mut conn, source_id, &candidate("https://x.test/b"), "h3")
            .await
            .unwrap();
        sync_categories(&mut conn, &["Tech".into(), "Other".into()]).await.unwrap();
        drop(conn);
        let tech = get_category_by_name(&pool, "Tech").await.unwrap().unwrap();

        let mut conn = pool.acquire().await.unwrap();
        replace_article_categories(&mut conn, article_id, &[(tech.id, 0.9), (tech.id, 0.8)])
            .await
            .unwrap();
        drop(conn);
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM article_categories WHERE article_id = ?")
            .bind(article_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn hide_ads_filters_feed() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let source_id = upsert_source(&mut conn, "feed", "rss", "https://x.test/rss", "{}", 1800, true)
            .await
            .unwrap();
        let (ad_id, _) = upsert_article(&mut conn, source_id, &candidate("https://x.test/ad"), "h4")
            .await
            .unwrap();
        upsert_article(&mut conn, source_id, &candidate("https://x.test/news"), "h5")
            .await
            .unwrap();
        apply_article_analysis(
            &mut conn,
            ad_id,
            None,
            Some("кратко"),
            true,
            0.9,
            "product_promotion",
            "promo markers",
            "[]",
            None,
        )
        .await
        .unwrap();

        drop(conn);
        let visible = feed_articles(
            &pool,
            &FeedParams {
                limit: 10,
                hide_ads: true,
                ..FeedParams::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].url, "https://x.test/news");
    }

    #[tokio::test]
    async fn stuck_tasks_are_cleared() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        seed_default_tasks(&mut conn).await.unwrap();
        drop(conn);
        let settings = get_schedule_settings(&pool).await.unwrap();
        let id = settings[0].id;
        let mut conn = pool.acquire().await.unwrap();
        assert!(mark_task_running(&mut conn, id).await.unwrap());
        // Second claim must fail while running.
        assert!(!mark_task_running(&mut conn, id).await.unwrap());

        let cleared = clear_stuck_tasks(&mut conn, Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(cleared, 1);
        assert!(mark_task_running(&mut conn, id).await.unwrap());
    }

    #[tokio::test]
    async fn daily_summary_overwrites_same_day() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let date = Utc::now().date_naive();
        upsert_daily_summary(&mut conn, date, "Tech", "первая версия", 3).await.unwrap();
        upsert_daily_summary(&mut conn, date, "Tech", "вторая версия", 5).await.unwrap();
        drop(conn);
        let summaries = get_daily_summaries(&pool, date).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary_text, "вторая версия");
        assert_eq!(summaries[0].articles_count, 5);
    }

    #[tokio::test]
    async fn task_queue_lifecycle() {
        let pool = pool_with_schema().await;
        let mut conn = pool.acquire().await.unwrap();
        let id = enqueue_task(&mut conn, "news_digest").await.unwrap();
        let claimed = claim_pending_task(&mut conn).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert!(claim_pending_task(&mut conn).await.unwrap().is_none());
        complete_task(&mut conn, id).await.unwrap();
        let task = get_task(&pool, id).await.unwrap().unwrap();
        assert_eq!(task.status, "completed");
    }
}
