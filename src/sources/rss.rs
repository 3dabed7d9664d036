//! RSS/Atom source adapter.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::html::url_hash_key;
use crate::http::FetchOptions;
use crate::models::{CandidateArticle, MediaFile, MediaType, Source, SourceType};

use super::{FetchContext, SourceAdapter};

pub struct RssAdapter {
    min_content_length: usize,
}

impl RssAdapter {
    pub fn new(min_content_length: usize) -> Self {
        Self { min_content_length }
    }
}

#[async_trait]
impl SourceAdapter for RssAdapter {
    fn kind(&self) -> SourceType {
        SourceType::Rss
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        source: &Source,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<CandidateArticle>> {
        let response = ctx
            .http
            .fetch(&source.url, &FetchOptions::default(), cancel)
            .await?;
        let feed = feed_rs::parser::parse(&response.body[..])?;
        debug!(source = %source.name, entries = feed.entries.len(), "parsed feed");

        let max_items = source
            .config_json()
            .get("max_items")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;

        let mut candidates = Vec::new();
        for entry in feed.entries.into_iter().take(max_items) {
            let url = match entry.links.first().map(|l| l.href.clone()) {
                Some(url) => url,
                None => {
                    debug!(entry_id = %entry.id, "skipping entry without link");
                    continue;
                }
            };
            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default();

            // Prefer full content over the summary; both are usually HTML.
            let raw_body = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_default();
            let body = strip_html(&raw_body);

            if title.is_empty() && body.is_empty() {
                continue;
            }

            let published_at = entry.published.or(entry.updated);

            let mut media: Vec<MediaFile> = Vec::new();
            for media_object in &entry.media {
                let thumbnail = media_object
                    .thumbnails
                    .first()
                    .map(|t| t.image.uri.clone());
                for content in &media_object.content {
                    let Some(content_url) = content.url.as_ref() else {
                        continue;
                    };
                    let mime = content
                        .content_type
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_default();
                    let media_type = if mime.starts_with("video") {
                        MediaType::Video
                    } else if mime.starts_with("image") || mime.is_empty() {
                        MediaType::Image
                    } else {
                        MediaType::Document
                    };
                    media.push(MediaFile {
                        url: content_url.to_string(),
                        media_type,
                        thumbnail: thumbnail.clone(),
                    });
                }
            }

            // Items without a guid dedup on the hashable URL form plus the
            // title, so reordered query parameters collapse together.
            let dedup_key = if entry.id.is_empty() {
                let hash_url = url_hash_key(&url).unwrap_or_else(|| url.clone());
                let mut hasher = Sha256::new();
                hasher.update(hash_url.as_bytes());
                hasher.update(b"|");
                hasher.update(title.as_bytes());
                format!("sha256:{:x}", hasher.finalize())
            } else {
                entry.id.clone()
            };

            candidates.push(CandidateArticle {
                title,
                url,
                content: body,
                published_at,
                media_files: media,
                metadata: serde_json::json!({ "dedup_key": dedup_key }),
            });
        }

        if candidates.is_empty() {
            warn!(source = %source.name, url = %source.url, "feed returned no usable items");
        }
        Ok(candidates)
    }

    /// Feeds that ship only a teaser need the article page extracted.
    fn needs_body_extraction(&self, item: &CandidateArticle) -> bool {
        item.content.trim().chars().count() < self.min_content_length
    }
}

/// Flatten HTML feed bodies to plain text; non-HTML passes through.
fn strip_html(text: &str) -> String {
    if !text.contains('<') {
        return text.trim().to_string();
    }
    html2text::from_read(text.as_bytes(), 200)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[test]
    fn strip_html_flattens_markup() {
        let html = "<p>Первый абзац со <b>смыслом</b>.</p>";
        let text = strip_html(html);
        assert!(text.contains("Первый абзац со"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(strip_html("  просто текст "), "просто текст");
    }

    #[test]
    fn short_items_need_extraction() {
        let adapter = RssAdapter::new(200);
        let mut item = CandidateArticle {
            title: "t".into(),
            url: "https://x.test/a".into(),
            content: "кратко".into(),
            published_at: None,
            media_files: Vec::new(),
            metadata: serde_json::json!({}),
        };
        assert!(adapter.needs_body_extraction(&item));
        item.content = "длинный текст ".repeat(30);
        assert!(!adapter.needs_body_extraction(&item));
    }

    #[tokio::test]
    async fn feed_entries_become_candidates() {
        let feed = format!(
            r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
                <title>Test feed</title>
                <item>
                    <title>Hello</title>
                    <link>https://x.test/a</link>
                    <guid>guid-1</guid>
                    <pubDate>Wed, 15 Jan 2025 10:00:00 GMT</pubDate>
                    <description>{}</description>
                </item>
                <item>
                    <title>Second</title>
                    <link>https://x.test/b</link>
                    <description>Short teaser</description>
                </item>
            </channel></rss>"#,
            "Новость с достаточно длинным телом. ".repeat(25)
        );
        let parsed = feed_rs::parser::parse(feed.as_bytes()).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        let first = &parsed.entries[0];
        assert_eq!(first.id, "guid-1");
        let expected: DateTime<Utc> = "2025-01-15T10:00:00Z".parse().unwrap();
        assert_eq!(first.published, Some(expected));
    }
}
