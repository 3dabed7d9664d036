//! Telegram Bot API output adapter. Messages arrive pre-split (≤ 4096
//! chars, HTML subset b/i/a); this layer owns delivery and the provider's
//! rate limiting.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<BotApiParameters>,
}

#[derive(Debug, Deserialize)]
struct BotApiParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

pub struct TelegramSender {
    http: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramSender {
    pub fn new(token: String, chat_id: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            token,
            chat_id,
        })
    }

    /// Send one HTML message; waits out `retry_after` on 429 responses.
    pub async fn send_message(
        &self,
        text: &str,
        inline_url_button: Option<(&str, &str)>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some((label, button_url)) = inline_url_button {
            payload["reply_markup"] = json!({
                "inline_keyboard": [[{"text": label, "url": button_url}]]
            });
        }

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                anyhow::bail!("telegram send cancelled");
            }
            let response = self.http.post(&url).json(&payload).send().await?;
            let status = response.status();
            let body: BotApiResponse = response.json().await?;

            if body.ok {
                info!(chars = text.chars().count(), "telegram message sent");
                return Ok(());
            }

            if status.as_u16() == 429 {
                let retry_after = body
                    .parameters
                    .and_then(|p| p.retry_after)
                    .unwrap_or(5);
                warn!(retry_after, "telegram rate limited, waiting");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(retry_after)) => {}
                    _ = cancel.cancelled() => anyhow::bail!("telegram send cancelled"),
                }
                continue;
            }

            attempt += 1;
            if attempt > 3 {
                anyhow::bail!(
                    "telegram send failed: {}",
                    body.description.unwrap_or_else(|| format!("HTTP {status}"))
                );
            }
            tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
        }
    }

    /// Deliver all digest parts in order; the Telegraph button rides on the
    /// last part.
    pub async fn send_digest(
        &self,
        messages: &[String],
        telegraph_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let last = messages.len().saturating_sub(1);
        for (i, message) in messages.iter().enumerate() {
            let button = if i == last {
                telegraph_url.map(|u| ("📖 Читать полностью", u))
            } else {
                None
            };
            self.send_message(message, button, cancel).await?;
        }
        Ok(())
    }
}
