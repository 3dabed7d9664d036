//! Headless browser rendering, used only by the content extractor.
//!
//! A small pool of browser pages behind a semaphore. Every render runs
//! under a strict total budget: a short navigation timeout on the first
//! attempt, a longer one on the single retry. Pages are always closed, on
//! success, error and cancellation alike; a janitor tears the whole
//! browser down if a page leaks past its budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExtractError;

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub concurrency: usize,
    pub first_timeout_ms: u64,
    pub total_budget_ms: u64,
}

struct BrowserState {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    started: Instant,
}

pub struct BrowserPool {
    config: RenderConfig,
    permits: Arc<Semaphore>,
    state: Mutex<Option<BrowserState>>,
    open_pages: Arc<AtomicU64>,
    last_acquired_ms: Arc<AtomicU64>,
    epoch: Instant,
}

impl BrowserPool {
    pub fn new(config: RenderConfig) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            state: Mutex::new(None),
            open_pages: Arc::new(AtomicU64::new(0)),
            last_acquired_ms: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
            config,
        })
    }

    /// Open a page on the shared browser, launching it on first use.
    async fn open_page(&self, url: &str) -> Result<Page, ExtractError> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            let browser_config = BrowserConfig::builder()
                .no_sandbox()
                .build()
                .map_err(|e| ExtractError::Timeout(format!("browser config: {e}")))?;
            let (browser, mut handler) = Browser::launch(browser_config)
                .await
                .map_err(|e| ExtractError::Timeout(format!("browser launch: {e}")))?;
            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });
            info!("headless browser launched");
            *state = Some(BrowserState {
                browser,
                handler_task,
                started: Instant::now(),
            });
        }

        let browser_state = state.as_ref().ok_or(ExtractError::Cancelled)?;
        browser_state
            .browser
            .new_page(url)
            .await
            .map_err(|e| ExtractError::Timeout(format!("navigation to {url}: {e}")))
    }

    /// Render a page and return its post-JavaScript HTML.
    pub async fn render(
        &self,
        url: &str,
        wait_for_selector: Option<&str>,
        budget_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ExtractError> {
        let budget = Duration::from_millis(budget_ms.min(self.config.total_budget_ms));
        let started = Instant::now();

        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ExtractError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
            _ = tokio::time::sleep(budget) => {
                return Err(ExtractError::Timeout(format!(
                    "render budget spent waiting for a browser slot: {url}"
                )));
            }
        };
        self.last_acquired_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);

        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(ExtractError::Timeout(url.to_string()));
        }

        tokio::select! {
            result = self.render_with_retry(url, wait_for_selector, remaining) => result,
            _ = cancel.cancelled() => Err(ExtractError::Cancelled),
        }
    }

    async fn render_with_retry(
        &self,
        url: &str,
        wait_for_selector: Option<&str>,
        budget: Duration,
    ) -> Result<String, ExtractError> {
        let started = Instant::now();
        let first_timeout = Duration::from_millis(self.config.first_timeout_ms).min(budget);

        match self.render_once(url, wait_for_selector, first_timeout).await {
            Ok(html) => return Ok(html),
            Err(e) => debug!(url, error = %e, "first render attempt failed"),
        }

        let remaining = budget.saturating_sub(started.elapsed());
        if remaining < Duration::from_millis(500) {
            return Err(ExtractError::Timeout(url.to_string()));
        }
        self.render_once(url, wait_for_selector, remaining).await
    }

    async fn render_once(
        &self,
        url: &str,
        wait_for_selector: Option<&str>,
        timeout: Duration,
    ) -> Result<String, ExtractError> {
        let pages = self.open_pages.clone();
        let work = async {
            let page = self.open_page(url).await?;
            pages.fetch_add(1, Ordering::Relaxed);
            let guard = PageGuard {
                page: Some(page),
                pages: pages.clone(),
            };
            let page = guard.page.as_ref().ok_or(ExtractError::Cancelled)?;

            let _ = page.wait_for_navigation().await;
            if let Some(selector) = wait_for_selector {
                // Missing selector is not fatal; the page may still carry
                // usable content.
                if page.find_element(selector).await.is_err() {
                    debug!(url, selector, "wait-for selector not found after navigation");
                }
            }
            let html = page
                .content()
                .await
                .map_err(|e| ExtractError::Empty(format!("{url}: {e}")))?;
            drop(guard);
            Ok::<String, ExtractError>(html)
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ExtractError::Timeout(url.to_string())),
        }
    }

    /// Kill the browser when pages have leaked past the budget window.
    /// Called periodically from the janitor loop.
    pub async fn sweep(&self) {
        let open = self.open_pages.load(Ordering::Relaxed);
        if open == 0 {
            return;
        }
        let last_ms = self.last_acquired_ms.load(Ordering::Relaxed);
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let idle_ms = now_ms.saturating_sub(last_ms);
        if idle_ms > self.config.total_budget_ms.saturating_mul(4) {
            warn!(open_pages = open, idle_ms, "sweeping leaked browser contexts");
            self.shutdown().await;
        }
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut old) = state.take() {
            let age_secs = old.started.elapsed().as_secs();
            if old.browser.close().await.is_err() {
                let _ = old.browser.kill().await;
            }
            old.handler_task.abort();
            self.open_pages.store(0, Ordering::Relaxed);
            debug!(age_secs, "headless browser closed");
        }
    }
}

/// Closes the page on drop, whatever path got us there.
struct PageGuard {
    page: Option<Page>,
    pages: Arc<AtomicU64>,
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pages.fetch_sub(1, Ordering::Relaxed);
        if let Some(page) = self.page.take() {
            tokio::spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}
