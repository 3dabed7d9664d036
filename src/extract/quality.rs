//! Quality gate for extracted article bodies and sentence-aware truncation.

use std::sync::LazyLock;

use regex::Regex;

static AD_MARKER_PHRASES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)подпишитесь на (наш )?канал",
        r"(?i)читайте нас в",
        r"(?i)реклама\.",
        r"(?i)партнерский материал",
        r"(?i)sponsored content",
        r"(?i)advertisement",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

#[derive(Debug, Clone)]
pub struct QualityReport {
    pub length: usize,
    pub letter_ratio: f64,
    pub sentence_count: usize,
    pub score: f64,
    pub passed: bool,
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    pub min_length: usize,
    pub min_letter_ratio: f64,
}

impl QualityGate {
    pub fn new(min_length: usize) -> Self {
        Self {
            min_length,
            min_letter_ratio: 0.6,
        }
    }

    /// Score a candidate body. Length, letter ratio and sentence count are
    /// hard conditions; ad-marker phrases only lower the score.
    pub fn evaluate(&self, text: &str) -> QualityReport {
        let trimmed = text.trim();
        let length = trimmed.chars().count();

        let non_space: usize = trimmed.chars().filter(|c| !c.is_whitespace()).count();
        let letters = trimmed.chars().filter(|c| c.is_alphabetic()).count();
        let letter_ratio = if non_space == 0 {
            0.0
        } else {
            letters as f64 / non_space as f64
        };

        let sentence_count = count_sentences(trimmed);
        let required_sentences = if length < 500 { 2 } else { 4 };

        let mut score: f64 = 1.0;
        for marker in AD_MARKER_PHRASES.iter() {
            if marker.is_match(trimmed) {
                score -= 0.2;
            }
        }

        let passed = length >= self.min_length
            && letter_ratio >= self.min_letter_ratio
            && sentence_count >= required_sentences
            && score >= 0.5;

        QualityReport {
            length,
            letter_ratio,
            sentence_count,
            score: if passed { score } else { score.min(0.4) },
            passed,
        }
    }
}

fn count_sentences(text: &str) -> usize {
    let mut count = 0;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            // Collapse runs ("?!", "...") into one boundary.
            while matches!(chars.peek(), Some('.') | Some('!') | Some('?')) {
                chars.next();
            }
            count += 1;
        }
    }
    count
}

/// Truncate to at most `max_chars`, cutting at the end of the last complete
/// sentence that fits. Falls back to a whole-character cut only when no
/// sentence boundary exists inside the budget.
pub fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let mut last_boundary = None;
    let mut char_count = 0usize;
    let mut previous: Option<char> = None;
    for (byte_idx, c) in text.char_indices() {
        if char_count >= max_chars {
            break;
        }
        if let Some(p) = previous {
            if matches!(p, '.' | '!' | '?') && c.is_whitespace() {
                last_boundary = Some(byte_idx);
            }
        }
        previous = Some(c);
        char_count += 1;
    }

    if let Some(boundary) = last_boundary {
        return text[..boundary].trim_end().to_string();
    }

    text.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of_len(len: usize) -> String {
        // Two sentences, exactly `len` characters, no edge whitespace.
        let head = "Новость дня.";
        let filler = len - head.chars().count() - 2;
        format!("{head} {}.", "а".repeat(filler))
    }

    #[test]
    fn exact_min_length_passes_and_min_minus_one_fails() {
        let gate = QualityGate::new(200);
        let passing = body_of_len(200);
        assert!(gate.evaluate(&passing).passed, "exactly MIN must pass");

        let failing = body_of_len(199);
        assert!(!gate.evaluate(&failing).passed, "MIN-1 must fail");
    }

    #[test]
    fn low_letter_ratio_fails() {
        let gate = QualityGate::new(50);
        let numeric = "123456789 123456789 123456789. 123456789 123456789 123456789 123456789!";
        assert!(!gate.evaluate(numeric).passed);
    }

    #[test]
    fn single_sentence_fails() {
        let gate = QualityGate::new(50);
        let one_sentence = "Одно очень длинное предложение без настоящего конца которое тянется и тянется";
        assert!(!gate.evaluate(one_sentence).passed);
    }

    #[test]
    fn long_content_needs_more_sentences() {
        let gate = QualityGate::new(200);
        let mut long_two_sentences = "а".repeat(600);
        long_two_sentences.push_str(". Конец!");
        let report = gate.evaluate(&long_two_sentences);
        assert!(report.sentence_count < 4);
        assert!(!report.passed);
    }

    #[test]
    fn ad_markers_lower_score() {
        let gate = QualityGate::new(50);
        let mut body = body_of_len(300);
        body.push_str(" Подпишитесь на наш канал. Реклама. Партнерский материал.");
        let report = gate.evaluate(&body);
        assert!(report.score < 0.5);
        assert!(!report.passed);
    }

    #[test]
    fn truncation_cuts_at_sentence_boundary() {
        let text = "Первое предложение. Второе предложение. Третье предложение никогда не кончается";
        let cut = truncate_at_sentence(text, 45);
        assert_eq!(cut, "Первое предложение. Второе предложение.");
    }

    #[test]
    fn truncation_keeps_short_text_intact() {
        let text = "Короткий текст.";
        assert_eq!(truncate_at_sentence(text, 100), text);
    }

    #[test]
    fn truncation_without_boundary_cuts_whole_chars() {
        let text = "одно слово ".repeat(50);
        let cut = truncate_at_sentence(&text, 40);
        assert!(cut.chars().count() <= 40);
        assert!(!cut.is_empty());
    }

    #[test]
    fn boundary_in_last_tenth_is_used() {
        // A sentence boundary sits inside the last 10% of the budget; the
        // cut must land on it, not mid-sentence.
        let head = "а".repeat(95);
        let text = format!("{head}. хвост который не должен попасть в результат");
        let cut = truncate_at_sentence(&text, 100);
        assert!(cut.ends_with('.'));
        assert_eq!(cut.chars().count(), 96);
    }
}
