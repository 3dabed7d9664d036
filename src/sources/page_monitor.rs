//! Page monitor source: watches arbitrary pages through stored CSS
//! selectors and emits only the blocks that changed since the last
//! snapshot. Snapshots are content digests persisted in the settings
//! table.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::html::visible_text;
use crate::http::FetchOptions;
use crate::models::{CandidateArticle, Source, SourceType};
use crate::store;

use super::{FetchContext, SourceAdapter};

pub struct PageMonitorAdapter;

fn snapshot_key(source_id: i64) -> String {
    format!("page_monitor:{source_id}:digests")
}

fn block_digest(text: &str) -> String {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract the watched blocks from a page in document order.
pub fn extract_blocks(html: &str, css_selectors: &[String]) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut blocks = Vec::new();
    for raw in css_selectors {
        let selector = match Selector::parse(raw) {
            Ok(s) => s,
            Err(_) => {
                warn!(selector = %raw, "invalid page monitor selector");
                continue;
            }
        };
        for element in document.select(&selector) {
            let text = visible_text(&element.html());
            if !text.trim().is_empty() {
                blocks.push(text);
            }
        }
    }
    blocks
}

#[async_trait]
impl SourceAdapter for PageMonitorAdapter {
    fn kind(&self) -> SourceType {
        SourceType::Custom
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        source: &Source,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<CandidateArticle>> {
        let config = source.config_json();
        let selectors: Vec<String> = config
            .get("selectors")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if selectors.is_empty() {
            anyhow::bail!("page monitor source '{}' has no selectors", source.name);
        }

        let response = ctx
            .http
            .fetch(&source.url, &FetchOptions::default(), cancel)
            .await?;
        let blocks = extract_blocks(&response.text(), &selectors);

        // Previous snapshot: the set of block digests seen last time.
        let key = snapshot_key(source.id);
        let key_for_read = key.clone();
        let previous: HashSet<String> = ctx
            .queue
            .read(move |pool| {
                let key = key_for_read.clone();
                Box::pin(async move { store::get_setting(&pool, &key).await })
            })
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let mut current = Vec::new();
        let mut candidates = Vec::new();
        for block in &blocks {
            let digest = block_digest(block);
            if !previous.contains(&digest) {
                let title = block
                    .lines()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("Обновление страницы")
                    .chars()
                    .take(120)
                    .collect::<String>();
                candidates.push(CandidateArticle {
                    title,
                    // Each changed block gets a distinct stable URL under
                    // the monitored page.
                    url: format!("{}#block-{}", source.url, &digest[..12]),
                    content: block.clone(),
                    published_at: None,
                    media_files: Vec::new(),
                    metadata: serde_json::json!({ "monitor_digest": digest }),
                });
            }
            current.push(digest);
        }

        debug!(
            source = %source.name,
            blocks = blocks.len(),
            changed = candidates.len(),
            "page monitor diff complete"
        );

        // Persist the new snapshot only when something was parsed at all,
        // so a broken fetch never wipes history.
        if !current.is_empty() {
            let snapshot = serde_json::to_string(&current)?;
            ctx.queue
                .write(
                    "settings",
                    Arc::new(move |conn| {
                        let key = key.clone();
                        let snapshot = snapshot.clone();
                        Box::pin(async move { store::set_setting(conn, &key, &snapshot).await })
                    }),
                )
                .await?;
        }

        Ok(candidates)
    }

    fn needs_body_extraction(&self, _item: &CandidateArticle) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_V1: &str = r#"
        <div class="notice"><p>Объявление номер один о работе сервиса.</p></div>
        <div class="notice"><p>Объявление номер два про расписание.</p></div>
    "#;

    #[test]
    fn blocks_extract_in_document_order() {
        let blocks = extract_blocks(PAGE_V1, &[".notice".to_string()]);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("номер один"));
        assert!(blocks[1].contains("номер два"));
    }

    #[test]
    fn digest_ignores_whitespace_noise() {
        let a = block_digest("Объявление  номер один");
        let b = block_digest("Объявление номер\nодин");
        assert_eq!(a, b);
        assert_ne!(a, block_digest("Объявление номер два"));
    }

    #[test]
    fn invalid_selectors_are_skipped() {
        let blocks = extract_blocks(PAGE_V1, &["<<bad>>".to_string(), ".notice".to_string()]);
        assert_eq!(blocks.len(), 2);
    }
}
