//! Telegraph output adapter: long-form pages built from block nodes.
//! Oversized payloads split into continuation pages; the first page gets a
//! generated table of contents and its URL is the canonical one.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::digest::DigestBlock;

/// Telegraph rejects content much past 64 KB; stay under it.
const PAGE_CONTENT_BUDGET: usize = 55_000;

#[derive(Debug, Deserialize)]
struct TelegraphResponse {
    ok: bool,
    #[serde(default)]
    result: Option<TelegraphPage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegraphPage {
    url: String,
}

pub struct TelegraphPublisher {
    http: reqwest::Client,
    access_token: String,
}

impl TelegraphPublisher {
    pub fn new(access_token: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, access_token })
    }

    /// Publish the day's material. Returns the canonical page URL.
    pub async fn publish(&self, title: &str, blocks: &[DigestBlock]) -> anyhow::Result<String> {
        let chunks = paginate(blocks, PAGE_CONTENT_BUDGET);
        if chunks.is_empty() {
            anyhow::bail!("nothing to publish");
        }

        // Continuation pages first, so the lead page can link to them.
        let mut continuation_urls = Vec::new();
        for (i, chunk) in chunks.iter().enumerate().skip(1) {
            let page_title = format!("{title} (часть {})", i + 1);
            let nodes = blocks_to_nodes(chunk, &[]);
            let url = self.create_page(&page_title, nodes).await?;
            continuation_urls.push((page_title, url));
        }

        let toc: Vec<(String, String)> = continuation_urls;
        let nodes = blocks_to_nodes(&chunks[0], &toc);
        let url = self.create_page(title, nodes).await?;
        info!(url = %url, pages = chunks.len(), "telegraph publication complete");
        Ok(url)
    }

    async fn create_page(&self, title: &str, nodes: Vec<Value>) -> anyhow::Result<String> {
        let content = serde_json::to_string(&nodes)?;
        let response: TelegraphResponse = self
            .http
            .post("https://api.telegra.ph/createPage")
            .form(&[
                ("access_token", self.access_token.as_str()),
                ("title", title),
                ("content", content.as_str()),
                ("return_content", "false"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            anyhow::bail!(
                "telegraph createPage failed: {}",
                response.error.unwrap_or_else(|| "unknown error".into())
            );
        }
        let url = response
            .result
            .map(|r| r.url)
            .ok_or_else(|| anyhow::anyhow!("telegraph response missing page url"))?;
        debug!(url = %url, "telegraph page created");
        Ok(url)
    }
}

/// Split blocks into page-sized groups by rendered size.
pub fn paginate(blocks: &[DigestBlock], budget: usize) -> Vec<Vec<DigestBlock>> {
    let mut pages: Vec<Vec<DigestBlock>> = Vec::new();
    let mut current: Vec<DigestBlock> = Vec::new();
    let mut current_size = 0usize;

    for block in blocks {
        let size = block.category.len() + block.summary.len() + 64;
        if !current.is_empty() && current_size + size > budget {
            pages.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(block.clone());
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}

/// Render blocks as Telegraph DOM nodes, with an optional table of
/// contents linking to continuation pages.
pub fn blocks_to_nodes(blocks: &[DigestBlock], toc: &[(String, String)]) -> Vec<Value> {
    let mut nodes = Vec::new();

    if !toc.is_empty() {
        nodes.push(json!({"tag": "h4", "children": ["Содержание"]}));
        let items: Vec<Value> = toc
            .iter()
            .map(|(title, url)| {
                json!({"tag": "li", "children": [
                    {"tag": "a", "attrs": {"href": url}, "children": [title]}
                ]})
            })
            .collect();
        nodes.push(json!({"tag": "ul", "children": items}));
        nodes.push(json!({"tag": "hr"}));
    }

    for block in blocks {
        nodes.push(json!({
            "tag": "h3",
            "children": [format!("{} ({})", block.category, block.articles_count)]
        }));
        for paragraph in block.summary.split("\n\n").filter(|p| !p.trim().is_empty()) {
            nodes.push(json!({"tag": "p", "children": [paragraph.trim()]}));
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(category: &str, size: usize) -> DigestBlock {
        DigestBlock {
            category: category.into(),
            summary: "текст ".repeat(size / 6 + 1),
            articles_count: 2,
        }
    }

    #[test]
    fn small_payload_is_one_page() {
        let blocks = vec![block("Tech", 500), block("Business", 500)];
        let pages = paginate(&blocks, 55_000);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].len(), 2);
    }

    #[test]
    fn oversized_payload_splits() {
        let blocks: Vec<DigestBlock> = (0..6).map(|i| block(&format!("C{i}"), 2000)).collect();
        let pages = paginate(&blocks, 5000);
        assert!(pages.len() > 1);
        let total: usize = pages.iter().map(|p| p.len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn nodes_carry_headings_and_paragraphs() {
        let blocks = vec![DigestBlock {
            category: "Tech".into(),
            summary: "Первый абзац.\n\nВторой абзац.".into(),
            articles_count: 3,
        }];
        let nodes = blocks_to_nodes(&blocks, &[]);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0]["tag"], "h3");
        assert_eq!(nodes[1]["tag"], "p");
    }

    #[test]
    fn toc_links_continuations() {
        let nodes = blocks_to_nodes(
            &[block("Tech", 100)],
            &[("часть 2".to_string(), "https://telegra.ph/p2".to_string())],
        );
        assert_eq!(nodes[0]["tag"], "h4");
        let link = &nodes[1]["children"][0]["children"][0];
        assert_eq!(link["attrs"]["href"], "https://telegra.ph/p2");
    }
}
