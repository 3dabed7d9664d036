//! The single application context: every component is constructed once at
//! startup and shared through this struct. No module-level singletons.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::ai::{AiClient, AiConfig};
use crate::categories::CategoryEngine;
use crate::config::Config;
use crate::dbqueue::{DbQueue, QueueConfig};
use crate::extract::{ContentExtractor, ExtractorConfig};
use crate::filter::SmartFilter;
use crate::http::{HttpConfig, HttpFetcher};
use crate::memory::{ExtractionMemory, MemoryConfig};
use crate::migrations::MigrationReport;
use crate::render::{BrowserPool, RenderConfig};
use crate::sources::{FetchContext, SourceRegistry};
use crate::telegram_out::TelegramSender;
use crate::telegraph::TelegraphPublisher;

pub struct AppContext {
    pub config: Config,
    pub pool: SqlitePool,
    pub queue: Arc<DbQueue>,
    pub http: Arc<HttpFetcher>,
    pub render: Arc<BrowserPool>,
    pub memory: Arc<ExtractionMemory>,
    pub ai: Arc<AiClient>,
    pub extractor: Arc<ContentExtractor>,
    pub categories: Arc<CategoryEngine>,
    pub filter: Arc<SmartFilter>,
    pub registry: Arc<SourceRegistry>,
    pub telegram: Option<Arc<TelegramSender>>,
    pub telegraph: Option<Arc<TelegraphPublisher>>,
    /// Latest migration run outcome; the API surfaces it, including the
    /// degraded state after a failed migration.
    pub migration_report: Arc<RwLock<MigrationReport>>,
}

impl AppContext {
    pub fn build(
        config: Config,
        pool: SqlitePool,
        migration_report: MigrationReport,
    ) -> Result<Arc<Self>> {
        let queue = DbQueue::new(pool.clone(), QueueConfig::default());
        let http = Arc::new(HttpFetcher::new(HttpConfig::default())?);
        let render = BrowserPool::new(RenderConfig {
            concurrency: config.browser_concurrency,
            first_timeout_ms: config.render_timeout_first_ms,
            total_budget_ms: config.render_total_budget_ms,
        });
        let memory = ExtractionMemory::new(queue.clone(), MemoryConfig::default());
        let ai = AiClient::new(AiConfig {
            endpoint: config.ai_endpoint.clone(),
            api_key: config.ai_api_key.clone(),
            summarization_model: config.summarization_model.clone(),
            categorization_model: config.categorization_model.clone(),
            digest_model: config.digest_model.clone(),
            rps: config.rps,
            max_retries: 3,
            cache_ttl: config.cache_ttl,
            cache_capacity: 2048,
        })?;
        let extractor = Arc::new(ContentExtractor::new(
            http.clone(),
            render.clone(),
            memory.clone(),
            ai.clone(),
            ExtractorConfig {
                min_content_length: config.min_content_length,
                max_content_length: config.max_content_length,
                render_total_budget_ms: config.render_total_budget_ms,
            },
        ));
        let categories = Arc::new(CategoryEngine::new(
            queue.clone(),
            config.news_categories.clone(),
            config.default_category.clone(),
        ));
        let filter = Arc::new(SmartFilter::new(
            // The filter's floor is looser than the extraction gate: short
            // Telegram posts still deserve analysis.
            (config.min_content_length / 2).max(30),
            50_000,
        ));
        let registry = Arc::new(SourceRegistry::standard(config.min_content_length));

        let telegram = match (&config.telegram_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some(Arc::new(TelegramSender::new(
                token.clone(),
                chat_id.clone(),
            )?)),
            _ => None,
        };
        let telegraph = config
            .telegraph_access_token
            .as_ref()
            .map(|token| TelegraphPublisher::new(token.clone()).map(Arc::new))
            .transpose()?;

        Ok(Arc::new(Self {
            config,
            pool,
            queue,
            http,
            render,
            memory,
            ai,
            extractor,
            categories,
            filter,
            registry,
            telegram,
            telegraph,
            migration_report: Arc::new(RwLock::new(migration_report)),
        }))
    }

    pub fn fetch_context(&self) -> FetchContext {
        FetchContext {
            http: self.http.clone(),
            queue: self.queue.clone(),
        }
    }
}
