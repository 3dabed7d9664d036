//! Bounded-concurrency HTTP fetching with retries.
//!
//! All outbound plain-HTTP traffic goes through one shared client: one
//! connection pool, one global concurrency cap, one cap per host. Transient
//! failures (connect errors, 5xx, 429, timeouts) are retried with
//! exponential backoff and jitter before surfacing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub max_content_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("vesti/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            global_concurrency: 16,
            per_host_concurrency: 4,
            max_content_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub final_url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_html(&self) -> bool {
        self.header("content-type")
            .map(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
            .unwrap_or(true)
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpConfig,
    global: Arc<tokio::sync::Semaphore>,
    per_host: Mutex<HashMap<String, Arc<tokio::sync::Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.per_host_concurrency)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            global: Arc::new(tokio::sync::Semaphore::new(config.global_concurrency)),
            per_host: Mutex::new(HashMap::new()),
            config,
        })
    }

    fn host_permits(&self, host: &str) -> Arc<tokio::sync::Semaphore> {
        let mut map = self.per_host.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Semaphore::new(self.config.per_host_concurrency)))
            .clone()
    }

    /// GET a URL with retries. Holds one global permit and one per-host
    /// permit for the whole request, including retries, so a flapping host
    /// cannot monopolize the pool.
    pub async fn fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Transient {
            url: url.to_string(),
            message: format!("invalid URL: {e}"),
        })?;
        let host = parsed.host_str().unwrap_or("").to_string();

        let global = self.global.clone();
        let host_sem = self.host_permits(&host);
        let _global_permit = tokio::select! {
            permit = global.acquire_owned() => permit.map_err(|_| FetchError::Cancelled)?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        let _host_permit = tokio::select! {
            permit = host_sem.acquire_owned() => permit.map_err(|_| FetchError::Cancelled)?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let max_retries = opts.max_retries.unwrap_or(self.config.max_retries);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match self.try_fetch(url, opts, cancel).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    let delay = retry_delay(attempt);
                    debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if attempt > 0 {
                        warn!(url, attempts = attempt + 1, error = %e, "fetch gave up");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn try_fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }
        for (name, value) in &opts.headers {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| classify_reqwest(url, e))?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(FetchError::Transient {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        if status.is_client_error() {
            return Err(FetchError::Permanent {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();

        if let Some(len) = response.content_length() {
            if len as usize > self.config.max_content_size {
                return Err(FetchError::Permanent {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
        }

        let body = tokio::select! {
            bytes = response.bytes() => bytes.map_err(|e| classify_reqwest(url, e))?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        if body.len() > self.config.max_content_size {
            return Err(FetchError::Permanent {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(FetchResponse {
            status: status.as_u16(),
            final_url,
            headers,
            body: body.to_vec(),
        })
    }
}

fn classify_reqwest(url: &str, e: reqwest::Error) -> FetchError {
    if let Some(status) = e.status() {
        if status.is_client_error() && status.as_u16() != 429 {
            return FetchError::Permanent {
                url: url.to_string(),
                status: status.as_u16(),
            };
        }
    }
    FetchError::Transient {
        url: url.to_string(),
        message: e.to_string(),
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = 500u64.saturating_mul(1 << attempt.min(5));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Ratio of text characters outside markup to total length. Pages below a
/// small ratio are likely JS-rendered shells.
pub fn estimate_text_ratio(html: &str) -> f32 {
    let total_len = html.len();
    if total_len == 0 {
        return 0.0;
    }
    let mut in_tag = false;
    let mut text_chars = 0usize;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag && !c.is_whitespace() => text_chars += 1,
            _ => {}
        }
    }
    text_chars as f32 / total_len as f32
}

/// Heuristics for pages whose body only materializes under JavaScript.
pub fn needs_js_rendering(html: &str) -> bool {
    if estimate_text_ratio(html) < 0.05 {
        return true;
    }
    let js_hints = [
        "window.__NEXT_DATA__",
        "window.__NUXT__",
        "ng-app",
        "<div id=\"root\"></div>",
        "<div id=\"app\"></div>",
        "data-reactroot",
    ];
    if js_hints.iter().any(|h| html.contains(h)) {
        return true;
    }
    html.len() < 5000 && (html.contains("Loading...") || html.contains("Please wait"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_ratio_bounds() {
        let html = "<html><body><p>Hello World</p></body></html>";
        let ratio = estimate_text_ratio(html);
        assert!(ratio > 0.0 && ratio < 1.0);

        let mostly_tags = "<div><div><div><div></div></div></div></div>";
        assert!(estimate_text_ratio(mostly_tags) < 0.1);
    }

    #[test]
    fn spa_shells_need_rendering() {
        let spa = r#"<html><head></head><body><div id="root"></div><script src="app.js"></script></body></html>"#;
        assert!(needs_js_rendering(spa));

        let page = r#"<html><body><h1>Hello</h1><p>This is a paragraph with plenty of real text content that renders fine without any JavaScript at all.</p></body></html>"#;
        assert!(!needs_js_rendering(page));
    }

    #[test]
    fn retry_delay_grows() {
        let d1 = retry_delay(1);
        let d3 = retry_delay(3);
        assert!(d1 >= Duration::from_millis(1000));
        assert!(d3 >= Duration::from_millis(4000));
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let response = FetchResponse {
            status: 200,
            final_url: "https://x.test".into(),
            headers: vec![("Content-Type".into(), "text/html".into())],
            body: Vec::new(),
        };
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert!(response.is_html());
    }
}
