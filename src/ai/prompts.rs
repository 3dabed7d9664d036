//! Centralized, versioned prompts. Changing any prompt text must bump
//! `PROMPT_VERSION`, which is part of every response cache key.

/// Bumped on every prompt change so stale cached responses never leak
/// across prompt revisions.
pub const PROMPT_VERSION: &str = "v3";

const NEWS_DOMAINS: [&str; 8] = [
    "balkaninsight.com",
    "biznis.rs",
    "rts.rs",
    "b92.net",
    "politika.rs",
    "blic.rs",
    "novosti.rs",
    "euronews.rs",
];

/// Source framing for the analysis prompt; known news domains get a lower
/// advertisement prior.
pub fn source_context(url: &str) -> &'static str {
    let lower = url.to_lowercase();
    if NEWS_DOMAINS.iter().any(|d| lower.contains(d)) {
        "from a NEWS source"
    } else {
        "from an UNKNOWN source"
    }
}

fn summarization_rules() -> &'static str {
    "SUMMARIZATION REQUIREMENTS:
- Create DETAILED 5-6 informative sentences in Russian (minimum 200 characters)
- Start directly with main content (no introductory phrases)
- Structure: WHAT happened -> WHERE -> WHEN -> WHO -> WHY it matters -> RESULT
- Preserve ALL key facts, numbers, names, dates, statistics
- Each sentence should carry substantial new information
- Avoid repeating the title - add information not in the headline"
}

/// The single combined analysis prompt: title optimization, categories,
/// summary, ad verdict and publication date in one call.
pub fn unified_article_analysis(
    title: &str,
    content: &str,
    url: &str,
    categories: &[String],
) -> String {
    let content_preview: String = content.chars().take(3500).collect();
    let category_list = categories.join(", ");
    let context = source_context(url);

    format!(
        r#"Analyze this article and provide complete analysis in JSON format.

ARTICLE INFORMATION:
Title: {title}
URL: {url}
Source: {context}
Content: {content_preview}

ANALYSIS TASKS:
1. TITLE OPTIMIZATION: Create clear, informative headline (max 120 characters)
2. CATEGORIZATION: Choose one or more relevant categories
3. SUMMARIZATION: Create a DETAILED 5-6 sentence summary in Russian
4. ADVERTISEMENT DETECTION: Determine if content is promotional
5. DATE EXTRACTION: Find publication date if mentioned

AVAILABLE CATEGORIES: {category_list}

CATEGORIZATION PROCESS:
1. FIRST describe the content with 1-2 specific descriptive categories (your own words)
2. THEN map them to the available categories above
3. Include your descriptive labels in original_categories

GUIDELINES:
- NEWS articles report facts, events, research, government actions
- ADVERTISEMENTS promote products, services, events, or attract customers
- Prices or statistics alone do not indicate advertisements

TITLE OPTIMIZATION RULES:
- ALWAYS provide optimized_title (even if keeping the original)
- Maximum 120 characters, remove clickbait elements
- Keep the language of the content

{rules}

OUTPUT FORMAT (JSON):
{{
    "optimized_title": "Краткий информативный заголовок",
    "original_categories": ["financial_news", "banking_sector"],
    "categories": ["Business"],
    "category_confidences": [0.95],
    "summary": "Краткий пересказ 5-6 предложений...",
    "is_advertisement": false,
    "ad_type": "news_article",
    "ad_confidence": 0.1,
    "ad_reasoning": "Content focuses on news reporting",
    "publication_date": "2025-01-15"
}}

IMPORTANT: arrays "categories" and "category_confidences" must have the same length.
Answer ONLY with valid JSON, no additional text."#,
        rules = summarization_rules(),
    )
}

/// Appended when a previous response was missing required fields.
pub fn strict_retry_suffix() -> &'static str {
    "\n\nPREVIOUS RESPONSE WAS INVALID. Respond with ONE valid JSON object \
     containing ALL fields from OUTPUT FORMAT, with non-empty \"summary\" \
     and non-empty \"categories\". No markdown, no commentary."
}

/// Selector discovery over a compressed DOM skeleton.
pub fn selector_discovery(domain: &str, compressed_dom: &str) -> String {
    format!(
        r#"You analyze HTML structure to find CSS selectors for article body text.

DOMAIN: {domain}

COMPRESSED DOM (tag, id, class, itemprop, text sample per line):
{compressed_dom}

TASK: Propose up to 3 CSS selectors, best first, that select the main
article text container on pages of this domain. Prefer stable semantic
selectors (itemprop, article classes) over positional ones.

OUTPUT FORMAT (JSON):
{{"selectors": [".article__text", "main article", "[itemprop='articleBody']"]}}

Answer ONLY with valid JSON."#
    )
}

/// Per-category daily overview, combined later into the digest without any
/// further AI call.
pub fn category_summary(category: &str, articles_text: &str) -> String {
    format!(
        r#"Ты - новостной аналитик. Создай обзор ВСЕХ новостей категории {category} за день.

ЗАДАЧА: обозреть все значимые новости категории {category} в едином связном тексте.
ЛИМИТ: максимум 850 символов (сводка будет частью общего дайджеста).

ТРЕБОВАНИЯ:
- Единый связный текст, охватывающий все важные новости дня
- От главных событий к менее значимым
- Живой журналистский язык с переходами ("На фоне этого", "В то же время", "Кроме того")

НЕ ИСПОЛЬЗУЙ:
- Списки и перечисления
- Отдельные абзацы для каждой новости

НОВОСТИ ЗА ДЕНЬ:
{articles_text}

Создай целостный обзор одним связным текстом:"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_prompt_carries_inputs_and_categories() {
        let prompt = unified_article_analysis(
            "Заголовок",
            "Текст статьи",
            "https://news.test/a",
            &["Business".to_string(), "Tech".to_string()],
        );
        assert!(prompt.contains("Заголовок"));
        assert!(prompt.contains("Business, Tech"));
        assert!(prompt.contains("ONLY with valid JSON"));
    }

    #[test]
    fn content_is_capped() {
        let long = "а".repeat(10_000);
        let prompt = unified_article_analysis("t", &long, "https://x.test", &["Other".to_string()]);
        assert!(prompt.chars().count() < 6_000);
    }

    #[test]
    fn news_domains_get_news_context() {
        assert_eq!(source_context("https://www.rts.rs/page/1"), "from a NEWS source");
        assert_eq!(source_context("https://blog.example.com"), "from an UNKNOWN source");
    }
}
