//! Digest assembly. The digest is built from already-stored per-category
//! daily summaries - no AI call happens at emission time. Messages are
//! split at paragraph boundaries to fit the Telegram limit.

use chrono::NaiveDate;

pub const TELEGRAM_MAX_MESSAGE: usize = 4096;
/// Room left for part headers and the inline button payload.
const SAFETY_MARGIN: usize = 200;

#[derive(Debug, Clone)]
pub struct DigestBlock {
    pub category: String,
    pub summary: String,
    pub articles_count: i64,
}

/// Minimal HTML escaping for the Telegram `b/i/a` subset: summaries are
/// plain text, markup is ours alone.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn header(date: NaiveDate, part: Option<(usize, usize)>) -> String {
    match part {
        Some((n, total)) if total > 1 => {
            format!("📰 <b>Сводка новостей за {}</b> (часть {n}/{total})\n", date.format("%d.%m.%Y"))
        }
        _ => format!("📰 <b>Сводка новостей за {}</b>\n", date.format("%d.%m.%Y")),
    }
}

fn footer(total_articles: i64, categories: usize) -> String {
    format!("\n📊 {total_articles} новостей в {categories} категориях")
}

fn render_block(block: &DigestBlock) -> String {
    format!(
        "\n<b>{}</b> ({})\n{}\n",
        escape_html(&block.category),
        block.articles_count,
        escape_html(block.summary.trim())
    )
}

/// Assemble the digest messages for a day. Greedy packing of category
/// blocks; a block that alone exceeds the budget is split at paragraph
/// boundaries.
pub fn build_digest_messages(date: NaiveDate, blocks: &[DigestBlock]) -> Vec<String> {
    if blocks.is_empty() {
        return Vec::new();
    }
    let total_articles: i64 = blocks.iter().map(|b| b.articles_count).sum();
    let budget = TELEGRAM_MAX_MESSAGE - SAFETY_MARGIN;

    // Render blocks first, splitting any oversized ones.
    let mut rendered: Vec<String> = Vec::new();
    for block in blocks {
        let text = render_block(block);
        if text.chars().count() <= budget / 2 {
            rendered.push(text);
        } else {
            rendered.extend(split_at_paragraphs(&text, budget / 2));
        }
    }

    // Greedy packing into message bodies.
    let head_reserve = header(date, Some((9, 9))).chars().count();
    let foot = footer(total_articles, blocks.len());
    let body_budget = budget - head_reserve - foot.chars().count();

    let mut bodies: Vec<String> = Vec::new();
    let mut current = String::new();
    for piece in rendered {
        if !current.is_empty()
            && current.chars().count() + piece.chars().count() > body_budget
        {
            bodies.push(std::mem::take(&mut current));
        }
        current.push_str(&piece);
    }
    if !current.is_empty() {
        bodies.push(current);
    }

    let total = bodies.len();
    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| {
            let mut message = header(date, Some((i + 1, total)));
            message.push_str(&body);
            if i + 1 == total {
                message.push_str(&foot);
            } else {
                message.push_str("\n💬 Продолжение следует...");
            }
            message
        })
        .collect()
}

/// Split text into chunks of at most `max_chars`, preferring paragraph
/// boundaries, then line boundaries.
pub fn split_at_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let paragraph_len = paragraph.chars().count();
        let current_len = current.chars().count();
        if current_len > 0 && current_len + paragraph_len + 2 > max_chars {
            chunks.push(current.trim_end().to_string());
            current = String::new();
        }
        if paragraph_len > max_chars {
            // Paragraph alone does not fit; fall back to line boundaries.
            for line in paragraph.lines() {
                let line_len = line.chars().count();
                let current_len = current.chars().count();
                if current_len > 0 && current_len + line_len + 1 > max_chars {
                    chunks.push(current.trim_end().to_string());
                    current = String::new();
                }
                current.push_str(line);
                current.push('\n');
            }
        } else {
            current.push_str(paragraph);
            current.push_str("\n\n");
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    fn block(category: &str, len: usize, count: i64) -> DigestBlock {
        DigestBlock {
            category: category.into(),
            summary: "Новости дня идут одним текстом. ".repeat(len / 30 + 1),
            articles_count: count,
        }
    }

    #[test]
    fn small_digest_is_one_message() {
        let blocks = vec![block("Tech", 300, 4), block("Business", 300, 2)];
        let messages = build_digest_messages(date(), &blocks);
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert!(message.contains("Сводка новостей за 15.01.2025"));
        assert!(message.contains("<b>Tech</b> (4)"));
        assert!(message.contains("6 новостей в 2 категориях"));
        assert!(message.chars().count() <= TELEGRAM_MAX_MESSAGE);
    }

    #[test]
    fn oversized_digest_splits_under_limit() {
        let blocks: Vec<DigestBlock> = (0..8).map(|i| block(&format!("Cat{i}"), 1500, 3)).collect();
        let messages = build_digest_messages(date(), &blocks);
        assert!(messages.len() > 1);
        for message in &messages {
            assert!(message.chars().count() <= TELEGRAM_MAX_MESSAGE, "part too long");
        }
        assert!(messages[0].contains("часть 1/"));
        assert!(messages.last().unwrap().contains("категориях"));
    }

    #[test]
    fn split_prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "абзац один ".repeat(10), "абзац два ".repeat(10));
        let chunks = split_at_paragraphs(&text, 130);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("абзац один"));
        assert!(chunks[1].contains("абзац два"));
    }

    #[test]
    fn html_is_escaped_in_summaries() {
        let blocks = vec![DigestBlock {
            category: "Tech".into(),
            summary: "Запуск <script> и компания A&B".into(),
            articles_count: 1,
        }];
        let messages = build_digest_messages(date(), &blocks);
        assert!(messages[0].contains("&lt;script&gt;"));
        assert!(messages[0].contains("A&amp;B"));
    }

    #[test]
    fn empty_blocks_produce_no_messages() {
        assert!(build_digest_messages(date(), &[]).is_empty());
    }
}
