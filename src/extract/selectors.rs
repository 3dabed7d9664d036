//! Prioritized CSS selector extraction and DOM compression for AI
//! selector discovery.

use scraper::{Html, Selector};

use crate::html::visible_text;

/// Ranked selector ladder: schema.org microdata, then semantic HTML5, then
/// common CMS class patterns (including localized ones), then generic
/// containers.
pub const PRIORITY_SELECTORS: [&str; 19] = [
    "[itemprop='articleBody']",
    "main article",
    "article",
    "main",
    "[role='main']",
    ".prose",
    ".entry-content",
    ".post-content",
    ".article-content",
    ".article__text",
    ".article-body",
    ".story-body",
    ".post__text",
    ".news-text",
    ".js-mediator-article",
    ".content-text",
    "#content",
    ".content",
    ".post",
];

/// Apply one selector to a document and return the visible text of the
/// first (largest, when several) match.
pub fn apply_selector(html: &str, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    let document = Html::parse_document(html);

    let mut best: Option<String> = None;
    for element in document.select(&parsed) {
        let text = visible_text(&element.html());
        if text.is_empty() {
            continue;
        }
        match best {
            Some(ref current) if current.len() >= text.len() => {}
            _ => best = Some(text),
        }
    }
    best
}

/// Walk the prioritized ladder and return the first candidate body along
/// with the selector that produced it. The quality judgment stays with the
/// caller.
pub fn first_candidate(html: &str, min_length: usize) -> Option<(String, &'static str)> {
    for selector in PRIORITY_SELECTORS {
        if let Some(text) = apply_selector(html, selector) {
            if text.chars().count() >= min_length {
                return Some((text, selector));
            }
        }
    }
    None
}

const STRUCTURAL_TAGS: [&str; 12] = [
    "article", "main", "section", "div", "h1", "h2", "h3", "p", "time", "span", "td", "li",
];

/// Compress a document to its structural skeleton for the AI selector
/// discovery prompt: tag names with id/class/itemprop attributes and a
/// short text sample, capped in size.
pub fn compress_dom(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();

    for tag in STRUCTURAL_TAGS {
        let selector = match Selector::parse(tag) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for element in document.select(&selector) {
            if out.len() >= max_chars {
                return out;
            }
            let value = element.value();
            let mut line = format!("<{tag}");
            if let Some(id) = value.attr("id") {
                line.push_str(&format!(" id=\"{id}\""));
            }
            if let Some(class) = value.attr("class") {
                line.push_str(&format!(" class=\"{class}\""));
            }
            if let Some(itemprop) = value.attr("itemprop") {
                line.push_str(&format!(" itemprop=\"{itemprop}\""));
            }
            line.push('>');

            let text: String = element.text().collect::<String>();
            let sample: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
            let sample: String = sample.chars().take(80).collect();
            if !sample.is_empty() {
                line.push_str(&sample);
            }
            line.push('\n');
            out.push_str(&line);
        }
    }
    out.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <nav>Главная | Новости | Контакты</nav>
        <main>
        <article class="article__text">
            <h1>Заголовок</h1>
            <p>Первый абзац статьи с настоящим содержанием и фактами.</p>
            <p>Второй абзац статьи, в котором ещё больше деталей.</p>
        </article>
        </main>
        <footer>Подвал сайта</footer>
        </body></html>
    "#;

    #[test]
    fn selector_extracts_article_text() {
        let text = apply_selector(PAGE, ".article__text").unwrap();
        assert!(text.contains("Первый абзац"));
        assert!(!text.contains("Подвал"));
    }

    #[test]
    fn ladder_prefers_microdata_over_generic() {
        let microdata = r#"
            <div itemprop="articleBody"><p>Тело из микроданных, достаточно длинное для порога.</p></div>
            <div class="content"><p>Общий контейнер с другим текстом внутри страницы.</p></div>
        "#;
        let (text, selector) = first_candidate(microdata, 20).unwrap();
        assert_eq!(selector, "[itemprop='articleBody']");
        assert!(text.contains("микроданных"));
    }

    #[test]
    fn ladder_skips_too_short_matches() {
        let page = r#"
            <article>кратко</article>
            <div class="entry-content"><p>Длинный текст записи с достаточным количеством символов для прохождения порога.</p></div>
        "#;
        let (_, selector) = first_candidate(page, 40).unwrap();
        assert_eq!(selector, ".entry-content");
    }

    #[test]
    fn compressed_dom_keeps_identifiers() {
        let compressed = compress_dom(PAGE, 2000);
        assert!(compressed.contains("class=\"article__text\""));
        assert!(compressed.len() <= 2000);
    }
}
