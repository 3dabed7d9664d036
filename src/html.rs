//! Pure HTML/URL helpers shared by the extractor and source adapters.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::models::{MediaFile, MediaType};

/// Canonical form used for display and the article unique key: lowercase
/// host, no fragment. Query keys are preserved in order here; sorting is
/// only for hashing (`url_hash_key`).
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    if let Some(host) = url.host_str() {
        let lower = host.to_ascii_lowercase();
        if lower != host {
            url.set_host(Some(&lower)).ok()?;
        }
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Hashing key for a URL: canonical form with query keys sorted, so two
/// links differing only in parameter order dedupe together.
pub fn url_hash_key(raw: &str) -> Option<String> {
    let mut url = Url::parse(&canonical_url(raw)?).ok()?;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        return Some(url.to_string());
    }
    pairs.sort();
    url.query_pairs_mut().clear().extend_pairs(pairs.iter().map(|(k, v)| (k, v)));
    Some(url.to_string())
}

pub fn absolutize(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let joined = base.join(href).ok()?;
    if matches!(joined.scheme(), "http" | "https") {
        Some(joined.to_string())
    } else {
        None
    }
}

pub fn domain_of(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

const SKIPPED_TAGS: [&str; 8] = [
    "script", "style", "nav", "aside", "figure", "noscript", "iframe", "svg",
];

/// Extract the visible text of a fragment: skips chrome and script
/// containers, keeps the text of semantic inline markup (strong, em, a),
/// collapses whitespace, and keeps paragraph breaks.
pub fn visible_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    for child in fragment.root_element().children() {
        if let Some(element) = ElementRef::wrap(child) {
            collect_text(element, &mut out);
        } else if let Some(text) = child.value().as_text() {
            push_collapsed(&mut out, text);
        }
    }
    collapse_blank_lines(&out)
}

fn collect_text(element: ElementRef, out: &mut String) {
    let tag = element.value().name();
    if SKIPPED_TAGS.contains(&tag) {
        return;
    }
    let block = matches!(
        tag,
        "p" | "div" | "section" | "article" | "br" | "li" | "h1" | "h2" | "h3" | "h4" | "blockquote"
    );
    if block && !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            collect_text(child_element, out);
        } else if let Some(text) = child.value().as_text() {
            push_collapsed(out, text);
        }
    }
    if block && !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn push_collapsed(out: &mut String, text: &str) {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return;
    }
    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
        out.push(' ');
    }
    out.push_str(&collapsed);
}

fn collapse_blank_lines(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        lines.push(trimmed);
    }
    lines.join("\n")
}

const AD_NETWORK_DOMAINS: [&str; 6] = [
    "doubleclick.net",
    "googlesyndication.com",
    "googleadservices.com",
    "adservice.google.com",
    "taboola.com",
    "outbrain.com",
];

fn is_tracking_pixel(element: &ElementRef) -> bool {
    let small = |attr: &str| {
        element
            .value()
            .attr(attr)
            .and_then(|v| v.trim_end_matches("px").parse::<u32>().ok())
            .map(|n| n <= 2)
            .unwrap_or(false)
    };
    small("width") || small("height")
}

fn is_ad_network(url: &str) -> bool {
    domain_of(url)
        .map(|d| AD_NETWORK_DOMAINS.iter().any(|ad| d.ends_with(ad)))
        .unwrap_or(false)
}

/// Harvest ordered media references from a document: images, videos and
/// document links, deduplicated by URL, skipping tracking pixels and known
/// ad networks.
pub fn harvest_media(html: &str, base_url: &str) -> Vec<MediaFile> {
    let document = Html::parse_fragment(html);
    let mut seen = std::collections::HashSet::new();
    let mut media = Vec::new();

    let mut push = |url: String, media_type: MediaType, thumbnail: Option<String>| {
        if is_ad_network(&url) {
            return;
        }
        if seen.insert(url.clone()) {
            media.push(MediaFile {
                url,
                media_type,
                thumbnail,
            });
        }
    };

    if let Ok(selector) = Selector::parse("img[src]") {
        for element in document.select(&selector) {
            if is_tracking_pixel(&element) {
                continue;
            }
            if let Some(src) = element.value().attr("src") {
                if let Some(url) = absolutize(base_url, src) {
                    push(url, MediaType::Image, None);
                }
            }
        }
    }

    if let Ok(selector) = Selector::parse("video") {
        for element in document.select(&selector) {
            let poster = element
                .value()
                .attr("poster")
                .and_then(|p| absolutize(base_url, p));
            if let Some(src) = element.value().attr("src") {
                if let Some(url) = absolutize(base_url, src) {
                    push(url, MediaType::Video, poster.clone());
                    continue;
                }
            }
            if let Ok(source_selector) = Selector::parse("source[src]") {
                if let Some(source) = element.select(&source_selector).next() {
                    if let Some(src) = source.value().attr("src") {
                        if let Some(url) = absolutize(base_url, src) {
                            push(url, MediaType::Video, poster);
                        }
                    }
                }
            }
        }
    }

    const DOC_EXTENSIONS: [&str; 5] = [".pdf", ".doc", ".docx", ".xls", ".xlsx"];
    if let Ok(selector) = Selector::parse("a[href]") {
        for element in document.select(&selector) {
            if let Some(href) = element.value().attr("href") {
                let lower = href.to_ascii_lowercase();
                if DOC_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                    if let Some(url) = absolutize(base_url, href) {
                        push(url, MediaType::Document, None);
                    }
                }
            }
        }
    }

    media
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_lowercases_host_and_strips_fragment() {
        assert_eq!(
            canonical_url("https://News.Test/Path?b=2#section").as_deref(),
            Some("https://news.test/Path?b=2")
        );
        assert!(canonical_url("ftp://x.test/file").is_none());
    }

    #[test]
    fn hash_key_sorts_query_parameters() {
        let a = url_hash_key("https://x.test/a?b=2&a=1").unwrap();
        let b = url_hash_key("https://x.test/a?a=1&b=2").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn visible_text_skips_chrome_keeps_emphasis() {
        let html = r#"
            <nav>Menu items</nav>
            <p>The <strong>important</strong> news about <a href="/x">events</a>.</p>
            <aside>Related links</aside>
            <script>var x = 1;</script>
        "#;
        let text = visible_text(html);
        assert!(text.contains("The important news about events."));
        assert!(!text.contains("Menu items"));
        assert!(!text.contains("Related links"));
        assert!(!text.contains("var x"));
    }

    #[test]
    fn visible_text_keeps_paragraph_breaks() {
        let html = "<p>Первый абзац.</p><p>Второй абзац.</p>";
        let text = visible_text(html);
        assert_eq!(text, "Первый абзац.\nВторой абзац.");
    }

    #[test]
    fn media_harvest_dedupes_and_skips_pixels() {
        let html = r#"
            <img src="/a.jpg">
            <img src="/a.jpg">
            <img src="https://metrics.test/p.gif" width="1" height="1">
            <img src="https://ads.doubleclick.net/banner.png">
            <video poster="/poster.jpg"><source src="/clip.mp4"></video>
            <a href="/report.pdf">report</a>
        "#;
        let media = harvest_media(html, "https://news.test/article");
        let urls: Vec<&str> = media.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://news.test/a.jpg",
                "https://news.test/clip.mp4",
                "https://news.test/report.pdf",
            ]
        );
        assert_eq!(media[1].thumbnail.as_deref(), Some("https://news.test/poster.jpg"));
    }

    #[test]
    fn absolutize_resolves_relative_links() {
        assert_eq!(
            absolutize("https://x.test/section/page", "../other").as_deref(),
            Some("https://x.test/other")
        );
        assert!(absolutize("https://x.test/", "javascript:void(0)").is_none());
    }
}
