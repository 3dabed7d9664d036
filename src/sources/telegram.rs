//! Telegram channel source via the public web preview (`t.me/s/<channel>`).
//!
//! Parses message blocks out of the preview HTML: text, media, forward
//! attribution and the message permalink. No MTProto session, no link
//! following unless the source config asks for it.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::html::visible_text;
use crate::http::FetchOptions;
use crate::models::{CandidateArticle, MediaFile, MediaType, Source, SourceType};

use super::{FetchContext, SourceAdapter};

static BACKGROUND_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"background-image:\s*url\('([^']+)'\)").unwrap());

pub struct TelegramWebAdapter;

#[async_trait]
impl SourceAdapter for TelegramWebAdapter {
    fn kind(&self) -> SourceType {
        SourceType::Telegram
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        source: &Source,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<CandidateArticle>> {
        let channel = channel_name(source)
            .ok_or_else(|| anyhow::anyhow!("telegram source '{}' has no channel", source.name))?;
        let preview_url = format!("https://t.me/s/{channel}");

        let response = ctx
            .http
            .fetch(&preview_url, &FetchOptions::default(), cancel)
            .await?;
        let candidates = parse_channel_preview(&response.text());
        if candidates.is_empty() {
            warn!(source = %source.name, channel, "channel preview produced no messages");
        } else {
            debug!(source = %source.name, messages = candidates.len(), "parsed channel preview");
        }
        Ok(candidates)
    }

    /// Telegram messages carry their own full text; the preview is the
    /// body.
    fn needs_body_extraction(&self, _item: &CandidateArticle) -> bool {
        false
    }
}

fn channel_name(source: &Source) -> Option<String> {
    if let Some(channel) = source.config_json().get("channel").and_then(|c| c.as_str()) {
        return Some(channel.trim_start_matches('@').to_string());
    }
    // Fall back to the last path segment of t.me/<channel>.
    url::Url::parse(&source.url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
    })
}

/// Parse all message blocks of a channel preview page, oldest first, as
/// the page lists them.
pub fn parse_channel_preview(html: &str) -> Vec<CandidateArticle> {
    let document = Html::parse_document(html);
    let message_selector = match Selector::parse("div.tgme_widget_message") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let text_selector = Selector::parse("div.tgme_widget_message_text").ok();
    let link_selector = Selector::parse("a.tgme_widget_message_date").ok();
    let time_selector = Selector::parse("time[datetime]").ok();
    let photo_selector = Selector::parse("a.tgme_widget_message_photo_wrap").ok();
    let video_selector = Selector::parse("video").ok();
    let video_thumb_selector = Selector::parse("i.tgme_widget_message_video_thumb").ok();
    let document_selector = Selector::parse("a.tgme_widget_message_document_wrap").ok();
    let forward_selector = Selector::parse("a.tgme_widget_message_forwarded_from_name").ok();

    let mut out = Vec::new();
    for message in document.select(&message_selector) {
        let text = text_selector
            .as_ref()
            .and_then(|s| message.select(s).next())
            .map(|e| visible_text(&e.html()))
            .unwrap_or_default();

        let url = link_selector
            .as_ref()
            .and_then(|s| message.select(s).next())
            .and_then(|e| e.value().attr("href"))
            .map(str::to_string);
        let url = match url {
            Some(u) => u,
            None => continue,
        };

        let published_at: Option<DateTime<Utc>> = time_selector
            .as_ref()
            .and_then(|s| message.select(s).next())
            .and_then(|e| e.value().attr("datetime"))
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let mut media = Vec::new();
        if let Some(ref selector) = photo_selector {
            for photo in message.select(selector) {
                if let Some(style) = photo.value().attr("style") {
                    if let Some(caps) = BACKGROUND_URL.captures(style) {
                        media.push(MediaFile {
                            url: caps[1].to_string(),
                            media_type: MediaType::Image,
                            thumbnail: None,
                        });
                    }
                }
            }
        }
        if let Some(ref selector) = video_selector {
            for video in message.select(selector) {
                if let Some(src) = video.value().attr("src") {
                    let thumbnail = video_thumb_selector
                        .as_ref()
                        .and_then(|s| message.select(s).next())
                        .and_then(|e| e.value().attr("style"))
                        .and_then(|style| BACKGROUND_URL.captures(style))
                        .map(|caps| caps[1].to_string());
                    media.push(MediaFile {
                        url: src.to_string(),
                        media_type: MediaType::Video,
                        thumbnail,
                    });
                }
            }
        }
        if let Some(ref selector) = document_selector {
            for doc in message.select(selector) {
                if let Some(href) = doc.value().attr("href") {
                    media.push(MediaFile {
                        url: href.to_string(),
                        media_type: MediaType::Document,
                        thumbnail: None,
                    });
                }
            }
        }

        if text.is_empty() && media.is_empty() {
            continue;
        }

        // Forwards stay attached as metadata, not followed.
        let forwarded_from = forward_selector
            .as_ref()
            .and_then(|s| message.select(s).next())
            .map(|e| e.text().collect::<String>().trim().to_string())
            .filter(|name| !name.is_empty());

        let title = first_line_title(&text, &url);

        out.push(CandidateArticle {
            title,
            url,
            content: text,
            published_at,
            media_files: media,
            metadata: serde_json::json!({ "forwarded_from": forwarded_from }),
        });
    }
    out
}

/// Telegram messages have no headline; the first line, capped for digest
/// readability, stands in.
fn first_line_title(text: &str, url: &str) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if first_line.is_empty() {
        return format!("Сообщение {url}");
    }
    let capped: String = first_line.chars().take(120).collect();
    capped
}
