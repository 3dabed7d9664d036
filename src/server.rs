//! REST surface over the core. The web UI and auth live elsewhere; these
//! handlers only expose the pipeline's own contracts.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::context::AppContext;
use crate::migrations;
use crate::models::{Article, MediaFile};
use crate::scheduler::compute_next_run;
use crate::store;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/process/run", post(process_run))
        .route("/api/process/status/{id}", get(process_status))
        .route("/api/feed", get(feed))
        .route("/api/search", get(search))
        .route("/api/categories", get(categories))
        .route("/api/stats", get(stats))
        .route("/api/migrations/status", get(migrations_status))
        .route("/api/migrations/run", post(migrations_run))
        .route("/api/schedule/settings", get(schedule_settings))
        .route("/api/schedule/settings/{task}", put(update_schedule_setting))
        .with_state(ctx)
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ProcessRunResponse {
    task_id: i64,
    status: &'static str,
}

/// Queue one ad hoc full cycle; the scheduler picks it up on its next
/// tick. Returns a handle the caller can poll.
async fn process_run(State(ctx): State<Arc<AppContext>>) -> Response {
    let result = ctx
        .queue
        .write_returning("task_queue", |conn| {
            Box::pin(async move { store::enqueue_task(conn, "news_digest").await })
        })
        .await;
    match result {
        Ok(task_id) => {
            info!(task_id, "ad hoc processing cycle queued");
            (
                StatusCode::ACCEPTED,
                Json(ProcessRunResponse {
                    task_id,
                    status: "queued",
                }),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Serialize)]
struct TaskStatusResponse {
    task_id: i64,
    task_type: String,
    status: String,
    attempts: i64,
    error_message: Option<String>,
}

async fn process_status(State(ctx): State<Arc<AppContext>>, Path(id): Path<i64>) -> Response {
    match store::get_task(&ctx.pool, id).await {
        Ok(Some(task)) => Json(TaskStatusResponse {
            task_id: task.id,
            task_type: task.task_type,
            status: task.status,
            attempts: task.attempts,
            error_message: task.error_message,
        })
        .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no such task").into_response(),
        Err(e) => internal_error(e),
    }
}

// ---------------------------------------------------------------------------
// Feed & search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FeedQuery {
    category: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    since_hours: Option<i64>,
    #[serde(default)]
    hide_ads: bool,
}

#[derive(Serialize)]
struct ArticleView {
    id: i64,
    title: String,
    url: String,
    summary: Option<String>,
    published_at: DateTime<Utc>,
    is_advertisement: bool,
    media_files: Vec<MediaFile>,
    categories: Vec<String>,
}

async fn article_views(ctx: &AppContext, articles: Vec<Article>) -> Result<Vec<ArticleView>, sqlx::Error> {
    let mut views = Vec::with_capacity(articles.len());
    for article in articles {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT c.name FROM article_categories ac
             JOIN categories c ON c.id = ac.category_id
             WHERE ac.article_id = ? ORDER BY ac.confidence DESC",
        )
        .bind(article.id)
        .fetch_all(&ctx.pool)
        .await?;
        views.push(ArticleView {
            id: article.id,
            title: article.display_title().to_string(),
            url: article.url.clone(),
            summary: article.summary.clone(),
            published_at: article.published_at,
            is_advertisement: article.is_advertisement,
            media_files: article.media(),
            categories: names.into_iter().map(|n| n.0).collect(),
        });
    }
    Ok(views)
}

/// The feed always returns what is persisted; a missing summary never
/// hides an article.
async fn feed(State(ctx): State<Arc<AppContext>>, Query(query): Query<FeedQuery>) -> Response {
    let params = store::FeedParams {
        category: query.category,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0).max(0),
        since_hours: query.since_hours,
        hide_ads: query.hide_ads,
    };
    let articles = match store::feed_articles(&ctx.pool, &params).await {
        Ok(articles) => articles,
        Err(e) => return internal_error(e),
    };
    match article_views(&ctx, articles).await {
        Ok(views) => Json(views).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    category: Option<String>,
    since_hours: Option<i64>,
    limit: Option<i64>,
}

async fn search(State(ctx): State<Arc<AppContext>>, Query(query): Query<SearchQuery>) -> Response {
    if query.q.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "query must not be empty").into_response();
    }
    let articles = match store::search_articles(
        &ctx.pool,
        query.q.trim(),
        query.category.as_deref(),
        query.since_hours,
        query.limit.unwrap_or(50).clamp(1, 200),
    )
    .await
    {
        Ok(articles) => articles,
        Err(e) => return internal_error(e),
    };
    match article_views(&ctx, articles).await {
        Ok(views) => Json(views).into_response(),
        Err(e) => internal_error(e),
    }
}

// ---------------------------------------------------------------------------
// Categories & stats
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CategoryView {
    name: String,
    display_name: String,
    color: String,
    article_count: i64,
}

async fn categories(State(ctx): State<Arc<AppContext>>) -> Response {
    match store::category_counts(&ctx.pool).await {
        Ok(rows) => Json(
            rows.into_iter()
                .map(|(category, article_count)| CategoryView {
                    name: category.name,
                    display_name: category.display_name,
                    color: category.color,
                    article_count,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Serialize)]
struct StatsView {
    date: String,
    articles_fetched: i64,
    articles_processed: i64,
    api_calls_made: i64,
    errors_count: i64,
    processing_time_seconds: i64,
}

async fn stats(State(ctx): State<Arc<AppContext>>) -> Response {
    match store::get_processing_stats(&ctx.pool, 7).await {
        Ok(rows) => Json(
            rows.into_iter()
                .map(|s| StatsView {
                    date: s.date.format("%Y-%m-%d").to_string(),
                    articles_fetched: s.articles_fetched,
                    articles_processed: s.articles_processed,
                    api_calls_made: s.api_calls_made,
                    errors_count: s.errors_count,
                    processing_time_seconds: s.processing_time_seconds,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => internal_error(e),
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

async fn migrations_status(State(ctx): State<Arc<AppContext>>) -> Response {
    let report = ctx.migration_report.read().await.clone();
    Json(report).into_response()
}

async fn migrations_run(State(ctx): State<Arc<AppContext>>) -> Response {
    match migrations::run_migrations(&ctx.pool).await {
        Ok(report) => {
            *ctx.migration_report.write().await = report.clone();
            Json(report).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ---------------------------------------------------------------------------
// Schedule settings
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ScheduleView {
    task_name: String,
    enabled: bool,
    schedule_type: String,
    hour: i64,
    minute: i64,
    weekdays: Vec<u32>,
    timezone: String,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    is_running: bool,
}

async fn schedule_settings(State(ctx): State<Arc<AppContext>>) -> Response {
    match store::get_schedule_settings(&ctx.pool).await {
        Ok(settings) => Json(
            settings
                .into_iter()
                .map(|s| ScheduleView {
                    weekdays: s.weekdays_list(),
                    task_name: s.task_name,
                    enabled: s.enabled,
                    schedule_type: s.schedule_type,
                    hour: s.hour,
                    minute: s.minute,
                    timezone: s.timezone,
                    last_run: s.last_run,
                    next_run: s.next_run,
                    is_running: s.is_running,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct ScheduleUpdate {
    enabled: bool,
    schedule_type: String,
    hour: u32,
    minute: u32,
    #[serde(default)]
    weekdays: Vec<u32>,
    timezone: String,
    #[serde(default)]
    task_config: serde_json::Value,
}

async fn update_schedule_setting(
    State(ctx): State<Arc<AppContext>>,
    Path(task): Path<String>,
    Json(update): Json<ScheduleUpdate>,
) -> Response {
    if !matches!(update.schedule_type.as_str(), "daily" | "hourly") {
        return (StatusCode::BAD_REQUEST, "schedule_type must be 'daily' or 'hourly'").into_response();
    }
    if update.hour > 23 || update.minute > 59 {
        return (StatusCode::BAD_REQUEST, "hour/minute out of range").into_response();
    }
    if update.timezone.parse::<chrono_tz::Tz>().is_err() {
        return (StatusCode::BAD_REQUEST, "unknown timezone").into_response();
    }
    if update.weekdays.iter().any(|d| !(1..=7).contains(d)) {
        return (StatusCode::BAD_REQUEST, "weekdays must be within 1..=7").into_response();
    }

    let next_run = if update.enabled {
        compute_next_run(
            &update.schedule_type,
            update.hour,
            update.minute,
            &update.weekdays,
            &update.timezone,
            Utc::now(),
        )
    } else {
        None
    };

    let weekdays_json = serde_json::to_string(&update.weekdays).unwrap_or_else(|_| "[]".into());
    let task_config_json = update.task_config.to_string();
    let task_for_write = task.clone();
    let result = ctx
        .queue
        .write(
            "schedule_settings",
            Arc::new(move |conn| {
                let task = task_for_write.clone();
                let schedule_type = update.schedule_type.clone();
                let weekdays_json = weekdays_json.clone();
                let timezone = update.timezone.clone();
                let task_config_json = task_config_json.clone();
                Box::pin(async move {
                    store::update_schedule_setting(
                        conn,
                        &task,
                        update.enabled,
                        &schedule_type,
                        update.hour as i64,
                        update.minute as i64,
                        &weekdays_json,
                        &timezone,
                        &task_config_json,
                        next_run,
                    )
                    .await
                })
            }),
        )
        .await;

    match result {
        Ok(()) => match store::get_schedule_setting(&ctx.pool, &task).await {
            Ok(Some(setting)) => Json(ScheduleView {
                weekdays: setting.weekdays_list(),
                task_name: setting.task_name,
                enabled: setting.enabled,
                schedule_type: setting.schedule_type,
                hour: setting.hour,
                minute: setting.minute,
                timezone: setting.timezone,
                last_run: setting.last_run,
                next_run: setting.next_run,
                is_running: setting.is_running,
            })
            .into_response(),
            Ok(None) => (StatusCode::NOT_FOUND, "no such task").into_response(),
            Err(e) => internal_error(e),
        },
        Err(e) => internal_error(e),
    }
}
