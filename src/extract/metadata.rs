//! Metadata extraction that runs regardless of which body strategy wins:
//! publication dates and the "read more" link hop for listing pages.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::html::absolutize;

const ARTICLE_TYPES: [&str; 3] = ["NewsArticle", "Article", "BlogPosting"];

/// Publication date, tried in fidelity order: JSON-LD `datePublished`,
/// `article:published_time` meta, `<time datetime>`, then visible
/// localized date patterns.
pub fn extract_publication_date(html: &str) -> Option<NaiveDate> {
    let document = Html::parse_document(html);

    if let Some(date) = json_ld_date(&document) {
        return Some(date);
    }

    if let Ok(selector) = Selector::parse("meta[property='article:published_time']") {
        for element in document.select(&selector) {
            if let Some(date) = element.value().attr("content").and_then(parse_date_value) {
                return Some(date);
            }
        }
    }

    if let Ok(selector) = Selector::parse("time[datetime]") {
        for element in document.select(&selector) {
            if let Some(date) = element.value().attr("datetime").and_then(parse_date_value) {
                return Some(date);
            }
        }
    }

    visible_date(&document)
}

fn json_ld_documents(document: &Html) -> Vec<Value> {
    let mut out = Vec::new();
    if let Ok(selector) = Selector::parse("script[type='application/ld+json']") {
        for element in document.select(&selector) {
            let raw: String = element.text().collect();
            if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                out.push(value);
            }
        }
    }
    out
}

fn article_nodes(value: &Value) -> Vec<&Value> {
    let mut nodes = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                nodes.extend(article_nodes(item));
            }
        }
        Value::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                nodes.extend(article_nodes(graph));
            }
            let is_article = map
                .get("@type")
                .map(|t| match t {
                    Value::String(s) => ARTICLE_TYPES.contains(&s.as_str()),
                    Value::Array(list) => list
                        .iter()
                        .filter_map(|v| v.as_str())
                        .any(|s| ARTICLE_TYPES.contains(&s)),
                    _ => false,
                })
                .unwrap_or(false);
            if is_article {
                nodes.push(value);
            }
        }
        _ => {}
    }
    nodes
}

fn json_ld_date(document: &Html) -> Option<NaiveDate> {
    for value in json_ld_documents(document) {
        for node in article_nodes(&value) {
            if let Some(date) = node
                .get("datePublished")
                .and_then(|d| d.as_str())
                .and_then(parse_date_value)
            {
                return Some(date);
            }
        }
    }
    None
}

/// JSON-LD article body, when the page publishes one.
pub fn json_ld_body(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    for value in json_ld_documents(&document) {
        for node in article_nodes(&value) {
            if let Some(body) = node.get("articleBody").and_then(|b| b.as_str()) {
                let trimmed = body.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

/// Open Graph description, the last-resort body supplement.
pub fn og_description(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("meta[property='og:description']").ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|e| e.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse_date_value(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%d.%m.%Y") {
        return Some(date);
    }
    None
}

const RU_MONTHS: [(&str, u32); 12] = [
    ("январ", 1),
    ("феврал", 2),
    ("март", 3),
    ("апрел", 4),
    ("ма", 5),
    ("июн", 6),
    ("июл", 7),
    ("август", 8),
    ("сентябр", 9),
    ("октябр", 10),
    ("ноябр", 11),
    ("декабр", 12),
];

const EN_MONTHS: [(&str, u32); 12] = [
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

static RU_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,2})\s+([а-яё]+)\s+(\d{4})").unwrap());
static EN_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([a-z]+)\s+(\d{1,2}),\s+(\d{4})").unwrap());

fn visible_date(document: &Html) -> Option<NaiveDate> {
    let text: String = document.root_element().text().take(400).collect();

    if let Some(caps) = RU_DATE.captures(&text) {
        let day: u32 = caps[1].parse().ok()?;
        let month_word = caps[2].to_lowercase();
        let year: i32 = caps[3].parse().ok()?;
        // Longest prefix first, so "март" does not shadow "ма[йя]".
        let month = RU_MONTHS
            .iter()
            .filter(|(prefix, _)| month_word.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, m)| *m)?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    if let Some(caps) = EN_DATE.captures(&text) {
        let month_word = caps[1].to_lowercase();
        let day: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        let month = EN_MONTHS
            .iter()
            .find(|(name, _)| *name == month_word)
            .map(|(_, m)| *m)?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    None
}

static READ_MORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(read more|continue reading|full (story|article)|читать (далее|полностью)|подробнее)")
        .unwrap()
});

/// When a page looks like a listing, find the link that leads to the full
/// article. Followed at most once by the caller.
pub fn find_read_more_link(html: &str, base_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").ok()?;
    for element in document.select(&selector) {
        let text: String = element.text().collect::<String>().trim().to_string();
        if READ_MORE.is_match(&text) {
            if let Some(href) = element.value().attr("href") {
                let absolute = absolutize(base_url, href)?;
                if absolute != base_url {
                    return Some(absolute);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_ld_date_wins() {
        let html = r#"
            <html><head>
            <script type="application/ld+json">
            {"@type": "NewsArticle", "datePublished": "2025-01-15T10:00:00Z", "articleBody": "Тело."}
            </script>
            <meta property="article:published_time" content="2024-03-03T00:00:00Z">
            </head><body></body></html>
        "#;
        assert_eq!(
            extract_publication_date(html),
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
    }

    #[test]
    fn meta_tag_is_second_choice() {
        let html = r#"
            <html><head>
            <meta property="article:published_time" content="2024-03-03T08:30:00+01:00">
            </head><body><time datetime="2020-01-01">old</time></body></html>
        "#;
        assert_eq!(
            extract_publication_date(html),
            NaiveDate::from_ymd_opt(2024, 3, 3)
        );
    }

    #[test]
    fn visible_russian_date_parses() {
        let html = "<html><body><h1>Заголовок</h1><span>15 января 2025</span></body></html>";
        assert_eq!(
            extract_publication_date(html),
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
    }

    #[test]
    fn visible_may_parses_despite_short_stem() {
        let html = "<html><body><span>3 мая 2025</span></body></html>";
        assert_eq!(
            extract_publication_date(html),
            NaiveDate::from_ymd_opt(2025, 5, 3)
        );
    }

    #[test]
    fn english_visible_date_parses() {
        let html = "<html><body><p>Published January 15, 2025 by the desk</p></body></html>";
        assert_eq!(
            extract_publication_date(html),
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
    }

    #[test]
    fn json_ld_body_from_graph() {
        let html = r#"
            <script type="application/ld+json">
            {"@graph": [{"@type": "WebSite"}, {"@type": "Article", "articleBody": "Полный текст статьи."}]}
            </script>
        "#;
        assert_eq!(json_ld_body(html).as_deref(), Some("Полный текст статьи."));
    }

    #[test]
    fn read_more_link_resolves() {
        let html = r#"<div><a href="/full/123">Читать далее</a></div>"#;
        assert_eq!(
            find_read_more_link(html, "https://news.test/list").as_deref(),
            Some("https://news.test/full/123")
        );
    }

    #[test]
    fn no_date_returns_none() {
        assert_eq!(extract_publication_date("<html><body>no dates here</body></html>"), None);
    }
}
