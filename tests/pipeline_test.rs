//! End-to-end pipeline tests over an in-memory database: ingestion
//! idempotence, migration healing with data preservation, the category
//! link invariant and schedule settings round-trips.

use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;

use vesti::db::create_test_pool;
use vesti::dbqueue::{DbQueue, QueueConfig};
use vesti::filter::hash_content;
use vesti::migrations::{all_migrations, run_migrations, table_exists};
use vesti::models::{CandidateArticle, MediaFile};
use vesti::scheduler::compute_next_run;
use vesti::store;

fn feed_xml() -> String {
    let body = "Событие дня произошло в центре города. ".repeat(20);
    format!(
        r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
            <title>x.test</title>
            <item>
                <title>Hello</title>
                <link>https://x.test/a</link>
                <guid>a-1</guid>
                <pubDate>Wed, 15 Jan 2025 10:00:00 GMT</pubDate>
                <description>{body}</description>
            </item>
            <item>
                <title>Вторая новость дня</title>
                <link>https://x.test/b</link>
                <guid>b-1</guid>
                <pubDate>Wed, 15 Jan 2025 11:00:00 GMT</pubDate>
                <description>{body}</description>
            </item>
        </channel></rss>"#
    )
}

fn candidates_from_feed(xml: &str) -> Vec<CandidateArticle> {
    let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
    feed.entries
        .into_iter()
        .map(|entry| CandidateArticle {
            title: entry.title.map(|t| t.content).unwrap_or_default(),
            url: entry.links.first().map(|l| l.href.clone()).unwrap(),
            content: entry.summary.map(|s| s.content).unwrap_or_default(),
            published_at: entry.published,
            media_files: Vec::<MediaFile>::new(),
            metadata: serde_json::json!({}),
        })
        .collect()
}

#[tokio::test]
async fn ingesting_the_same_feed_twice_creates_no_duplicates() {
    let pool = create_test_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    let queue = DbQueue::new(pool.clone(), QueueConfig::default());

    let mut conn = pool.acquire().await.unwrap();
    let source_id = store::upsert_source(&mut conn, "x.test", "rss", "https://x.test/rss", "{}", 1800, true)
        .await
        .unwrap();
    drop(conn);

    let mut inserted_total = 0;
    for _ in 0..2 {
        for candidate in candidates_from_feed(&feed_xml()) {
            let hash = hash_content(&candidate.title, &candidate.content);
            let candidate = Arc::new(candidate);
            let (_, inserted) = queue
                .write_returning("articles", move |conn| {
                    let candidate = candidate.clone();
                    let hash = hash.clone();
                    Box::pin(async move {
                        store::upsert_article(&mut *conn, source_id, &candidate, &hash).await
                    })
                })
                .await
                .unwrap();
            if inserted {
                inserted_total += 1;
            }
        }
    }

    assert_eq!(inserted_total, 2, "second pass must be a no-op");
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 2);
}

#[tokio::test]
async fn migration_healing_preserves_existing_data() {
    let pool = create_test_pool().await.unwrap();

    // An old install: only the core tables exist, with data in them.
    for stmt in all_migrations()[0].statements {
        sqlx::query(stmt).execute(&pool).await.unwrap();
    }
    sqlx::query("INSERT INTO sources (name, source_type, url) VALUES ('old', 'rss', 'https://old.test/rss')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO articles (source_id, title, url, published_at) VALUES (1, 'kept', 'https://old.test/a', ?)",
    )
    .bind(Utc::now())
    .execute(&pool)
    .await
    .unwrap();

    let report = run_migrations(&pool).await.unwrap();
    assert!(!report.degraded);

    for table in [
        "categories",
        "article_categories",
        "category_mapping",
        "extraction_patterns",
        "domain_stability",
    ] {
        assert!(table_exists(&pool, table).await.unwrap(), "missing {table}");
    }

    // Every known version is recorded.
    let versions: Vec<i64> = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(&pool)
        .await
        .unwrap()
        .iter()
        .map(|r| r.get(0))
        .collect();
    assert_eq!(versions.len(), all_migrations().len());

    // No data lost, and the new columns exist with defaults.
    let row = sqlx::query("SELECT title, ad_processed FROM articles WHERE url = 'https://old.test/a'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("title"), "kept");
    assert!(!row.get::<bool, _>("ad_processed"));
}

#[tokio::test]
async fn processed_article_always_has_a_category_link() {
    let pool = create_test_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    store::sync_categories(
        &mut conn,
        &["Business".into(), "Tech".into(), "Other".into()],
    )
    .await
    .unwrap();
    let source_id = store::upsert_source(&mut conn, "x.test", "rss", "https://x.test/rss", "{}", 1800, true)
        .await
        .unwrap();
    let candidate = CandidateArticle {
        title: "Hello".into(),
        url: "https://x.test/a".into(),
        content: "Тело новости для проверки инварианта категорий.".into(),
        published_at: Some(Utc::now()),
        media_files: Vec::new(),
        metadata: serde_json::json!({}),
    };
    let (article_id, _) = store::upsert_article(&mut conn, source_id, &candidate, "h1")
        .await
        .unwrap();

    // Unmapped analysis output falls back to the default category; the
    // invariant is at least one link once category_processed flips.
    let other = store::get_category_by_name(&pool, "Other").await.unwrap().unwrap();
    store::replace_article_categories(&mut conn, article_id, &[(other.id, 0.45)])
        .await
        .unwrap();
    store::mark_category_processed(&mut conn, article_id).await.unwrap();

    let links: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM article_categories ac
         JOIN articles a ON a.id = ac.article_id
         WHERE a.category_processed = 1 AND a.id = ?",
    )
    .bind(article_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(links.0 >= 1);
}

#[tokio::test]
async fn schedule_settings_round_trip_and_next_run_is_deterministic() {
    let pool = create_test_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    let queue = DbQueue::new(pool.clone(), QueueConfig::default());

    let now = Utc::now();
    let next = compute_next_run("daily", 20, 30, &[1, 2, 3, 4, 5], "Europe/Belgrade", now);
    assert!(next.is_some());

    queue
        .write(
            "schedule_settings",
            Arc::new(move |conn| {
                Box::pin(async move {
                    store::update_schedule_setting(
                        conn,
                        "news_digest",
                        true,
                        "daily",
                        20,
                        30,
                        "[1,2,3,4,5]",
                        "Europe/Belgrade",
                        "{}",
                        next,
                    )
                    .await
                })
            }),
        )
        .await
        .unwrap();

    let setting = store::get_schedule_setting(&pool, "news_digest")
        .await
        .unwrap()
        .unwrap();
    assert!(setting.enabled);
    assert_eq!(setting.hour, 20);
    assert_eq!(setting.minute, 30);
    assert_eq!(setting.weekdays_list(), vec![1, 2, 3, 4, 5]);
    assert_eq!(setting.next_run, next);
    assert!(setting.next_run.unwrap() > now);
}

#[tokio::test]
async fn extraction_learning_saves_ai_credits() {
    use vesti::memory::{AttemptRecord, ExtractionMemory, MemoryConfig};

    let pool = create_test_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    let queue = DbQueue::new(pool.clone(), QueueConfig::default());
    let memory = ExtractionMemory::new(queue, MemoryConfig::default());

    // First articles succeed through the heuristic ladder and teach the
    // domain a selector.
    for _ in 0..5 {
        memory
            .record_attempt(AttemptRecord {
                url: "https://news.test/a",
                domain: "news.test",
                strategy: "css_selector",
                selector: Some(".article__text"),
                discovered_by: "heuristic",
                success: true,
                quality: 0.85,
                elapsed_ms: 90,
                error: None,
                http_status: Some(200),
            })
            .await
            .unwrap();
    }

    let snapshot = memory.lookup("news.test").await.unwrap();
    assert!(snapshot.is_stable());
    let best = snapshot.patterns.first().unwrap();
    assert!(best.is_stable);
    assert_eq!(best.selector_pattern, ".article__text");

    // The next article answers from the learned pattern; credits saved
    // must increase.
    memory.note_credits_saved("news.test").await.unwrap();
    memory.invalidate("news.test");
    let snapshot = memory.lookup("news.test").await.unwrap();
    assert_eq!(snapshot.stability.unwrap().ai_credits_saved, 1);
}
