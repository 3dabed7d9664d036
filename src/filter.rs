//! Quality gate in front of AI spend: hash dedup, language heuristic,
//! boilerplate rejection and the advertisement pre-filter.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

fn regexes(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
}

static SPAM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes(&[
        r"\b(?:click here|кликни здесь|жми сюда)\b",
        r"\b(?:buy now|купи сейчас|заказать сейчас)\b",
        r"\${3,}",
        r"!{4,}",
        r"\b(?:free|бесплатно)\s+(?:download|скачать)\b",
        r"\b(?:limited time|ограниченное время)\b",
        r"\b(?:act now|действуй сейчас)\b",
    ])
});

static NAVIGATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes(&[
        r"^\s*(?:home|главная|news|новости|about|о нас|contact|контакты)\s*$",
        r"^\s*(?:menu|меню|navigation|навигация)\s*",
        r"^\s*(?:cookie|куки)\s+(?:policy|политика)",
        r"^\s*(?:privacy|конфиденциальность)\s+(?:policy|политика)",
        r"^\s*(?:terms|условия)\s+(?:of service|использования)",
        r"^\s*(?:404|error|ошибка)\s*$",
    ])
});

/// Lowercase and collapse whitespace; the stable base for content hashing.
pub fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable digest over normalized title + body, the dedup identity of an
/// article's text.
pub fn hash_content(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(title).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize(body).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    TooShort(usize),
    TooLong(usize),
    WeakTitle,
    Navigation,
    WrongLanguage,
    Spam,
    DuplicateRecent,
    LowQuality(f64),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::TooShort(n) => write!(f, "content too short ({n} chars)"),
            Rejection::TooLong(n) => write!(f, "content too long ({n} chars)"),
            Rejection::WeakTitle => write!(f, "title too short"),
            Rejection::Navigation => write!(f, "navigation/boilerplate content"),
            Rejection::WrongLanguage => write!(f, "content not in an accepted language"),
            Rejection::Spam => write!(f, "spam markers"),
            Rejection::DuplicateRecent => write!(f, "duplicate of recently seen content"),
            Rejection::LowQuality(score) => write!(f, "quality score too low ({score:.2})"),
        }
    }
}

pub struct SmartFilter {
    min_content_length: usize,
    max_content_length: usize,
    min_title_length: usize,
    dedup_window: Duration,
    recent_hashes: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SmartFilter {
    pub fn new(min_content_length: usize, max_content_length: usize) -> Self {
        Self {
            min_content_length,
            max_content_length,
            min_title_length: 10,
            dedup_window: Duration::hours(24),
            recent_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Gate one candidate. `allow_other_languages` comes from the source
    /// config; Russian and English always pass.
    pub fn check(
        &self,
        title: &str,
        content: &str,
        allow_other_languages: bool,
    ) -> Result<(), Rejection> {
        let body = content.trim();
        if body.len() < self.min_content_length {
            return Err(Rejection::TooShort(body.len()));
        }
        if body.len() > self.max_content_length {
            return Err(Rejection::TooLong(body.len()));
        }
        if title.trim().len() < self.min_title_length {
            return Err(Rejection::WeakTitle);
        }
        if self.is_navigation(title, body) {
            return Err(Rejection::Navigation);
        }
        if !allow_other_languages && !is_accepted_language(body) {
            return Err(Rejection::WrongLanguage);
        }
        if self.is_spam(title, body) {
            return Err(Rejection::Spam);
        }
        if self.seen_recently(&hash_content(title, body)) {
            return Err(Rejection::DuplicateRecent);
        }
        let score = quality_score(title, body);
        if score < 0.4 {
            return Err(Rejection::LowQuality(score));
        }
        Ok(())
    }

    fn is_navigation(&self, title: &str, content: &str) -> bool {
        NAVIGATION_PATTERNS
            .iter()
            .any(|p| p.is_match(title) || p.is_match(content))
    }

    fn is_spam(&self, title: &str, content: &str) -> bool {
        let text = format!("{title} {content}");
        SPAM_PATTERNS.iter().any(|p| p.is_match(&text))
    }

    /// 24h sliding window over content hashes; inserts when unseen.
    fn seen_recently(&self, hash: &str) -> bool {
        let now = Utc::now();
        let cutoff = now - self.dedup_window;
        let mut recent = self.recent_hashes.lock().unwrap_or_else(|p| p.into_inner());
        recent.retain(|_, seen_at| *seen_at > cutoff);
        if recent.contains_key(hash) {
            return true;
        }
        recent.insert(hash.to_string(), now);
        false
    }
}

/// Accepted when clearly Russian (Cyrillic ratio ≥ 0.3) or clearly Latin
/// (ratio ≤ 0.1). Short texts get the benefit of the doubt.
pub fn is_accepted_language(content: &str) -> bool {
    let cyrillic = content.chars().filter(|c| matches!(c, 'а'..='я' | 'А'..='Я' | 'ё' | 'Ё')).count();
    let latin = content.chars().filter(|c| c.is_ascii_alphabetic()).count();
    let total = cyrillic + latin;
    if total < 50 {
        return true;
    }
    let ratio = cyrillic as f64 / total as f64;
    ratio >= 0.3 || ratio <= 0.1
}

static CAPS_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-ZА-Я]{10,}").unwrap());
static PERSONAL_SERVICE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes(&[
        r"я\s+программист",
        r"мой\s+опыт",
        r"моя\s+компания",
        r"предлагаю\s+услуги",
        r"обращайтесь\s+по\s+телефону",
        r"специализируюсь",
        r"оказываю\s+услуги",
        r"свяжитесь\s+со\s+мной",
    ])
});

/// Composite 0..1 quality score: structure raises it, shouting and
/// personal-service pitches sink it.
pub fn quality_score(title: &str, content: &str) -> f64 {
    let mut score: f64 = 0.5;

    if title.trim().len() > 20 {
        score += 0.1;
    }

    let sentence_count = content.matches(['.', '!', '?']).count();
    if (3..=50).contains(&sentence_count) {
        score += 0.15;
    } else if sentence_count > 50 {
        score += 0.05;
    }

    let paragraph_count = content.split("\n\n").filter(|p| !p.trim().is_empty()).count();
    if paragraph_count >= 2 {
        score += 0.1;
    }

    let word_count = content.split_whitespace().count();
    if (50..=2000).contains(&word_count) {
        score += 0.1;
    } else if word_count > 2000 {
        score += 0.05;
    }

    if CAPS_RUN.is_match(content) {
        score -= 0.1;
    }
    if content.matches("!!").count() > 3 {
        score -= 0.1;
    }

    let text = format!("{title} {content}");
    for pattern in PERSONAL_SERVICE.iter() {
        if pattern.is_match(&text) {
            score -= 0.3;
            break;
        }
    }

    score.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Advertisement pre-filter
// ---------------------------------------------------------------------------

static STRONG_AD: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes(&[
        r"\bреклама\b",
        r"\bрекламн\w*\b",
        r"\bsponsored\b",
        r"\bпартнерск\w*\s+материал\b",
        r"\bкупи\w*\s+сейчас\b",
        r"\bbuy now\b",
        r"\bshop now\b",
        r"\bзаказать\s+сейчас\b",
        r"\bпромокод\b",
        r"\buse code\b",
        r"\bскидк\w*\s+\d+%",
    ])
});

static WEAK_AD: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes(&[
        r"\bакци[яи]\b",
        r"\bpromotion\b",
        r"\bбесплатн\w*\b",
        r"\bв\s+подарок\b",
        r"\bподписывайтесь\b",
        r"\bsubscribe\b",
        r"\bcontact us\b",
    ])
});

static EVENT_AD: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes(&[
        r"приходите",
        r"участвуйте",
        r"регистрация",
        r"билеты",
        r"\btickets\b",
        r"\bregister\b",
    ])
});

static NEWS_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    regexes(&[
        r"согласно\s+исследованию",
        r"по\s+данным",
        r"эксперты\s+считают",
        r"\baccording to\b",
        r"\bresearch shows\b",
        r"правительство",
        r"министерство",
        r"парламент",
    ])
});

const URL_AD_MARKERS: [&str; 5] = ["utm_campaign", "affid=", "affiliate=", "coupon=", "promo="];

const NEWS_DOMAINS: [&str; 8] = [
    "balkaninsight.com",
    "biznis.rs",
    "rts.rs",
    "b92.net",
    "politika.rs",
    "blic.rs",
    "novosti.rs",
    "n1info.rs",
];

#[derive(Debug, Clone)]
pub struct AdSignal {
    pub flagged: bool,
    pub score: f64,
    pub markers: Vec<String>,
}

/// Lexical ad probability prior to AI confirmation. News-source domains get
/// a discount and a higher flag threshold never applies to them.
pub fn ad_prefilter(title: &str, content: &str, url: &str) -> AdSignal {
    let text = format!("{} {}", title, content).to_lowercase();
    let url_lower = url.to_lowercase();
    let is_news_source = NEWS_DOMAINS.iter().any(|d| url_lower.contains(d));

    let mut score = 0.0f64;
    let mut markers = Vec::new();

    for pattern in STRONG_AD.iter() {
        if pattern.is_match(&text) {
            markers.push(format!("strong_ad:{}", pattern.as_str()));
            score += 0.4;
        }
    }
    for pattern in WEAK_AD.iter() {
        if pattern.is_match(&text) {
            markers.push(format!("weak_ad:{}", pattern.as_str()));
            score += if is_news_source { 0.1 } else { 0.2 };
        }
    }
    for marker in URL_AD_MARKERS {
        if url_lower.contains(marker) {
            markers.push(format!("url:{marker}"));
            score += 0.3;
        }
    }
    for pattern in PERSONAL_SERVICE.iter() {
        if pattern.is_match(&text) {
            markers.push(format!("personal:{}", pattern.as_str()));
            score += 0.35;
        }
    }
    for pattern in EVENT_AD.iter() {
        if pattern.is_match(&text) {
            markers.push(format!("event:{}", pattern.as_str()));
            score += 0.15;
        }
    }
    for pattern in NEWS_INDICATORS.iter() {
        if pattern.is_match(&text) {
            markers.push(format!("news_indicator:{}", pattern.as_str()));
            score -= 0.1;
        }
    }

    if is_news_source {
        markers.push("source:news_domain".to_string());
        score *= 0.6;
    }

    let score = score.clamp(0.0, 1.0);
    let threshold = if is_news_source { 0.25 } else { 0.35 };
    AdSignal {
        flagged: score >= threshold,
        score,
        markers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_BODY: &str = "Сегодня в Белграде открылась новая технологическая конференция. \
        Участники обсуждали развитие искусственного интеллекта в регионе. \
        По данным организаторов, мероприятие посетили более тысячи специалистов. \
        Эксперты считают, что интерес к теме продолжит расти.\n\n\
        Программа конференции продлится три дня и завершится хакатоном.";

    #[test]
    fn hash_is_stable_under_whitespace_and_case() {
        let a = hash_content("Hello World", "Body  text");
        let b = hash_content("hello   world", "body text");
        assert_eq!(a, b);
        let c = hash_content("hello world", "different body");
        assert_ne!(a, c);
    }

    #[test]
    fn good_article_passes() {
        let filter = SmartFilter::new(100, 50_000);
        assert!(filter
            .check("Конференция по ИИ открылась в Белграде", GOOD_BODY, false)
            .is_ok());
    }

    #[test]
    fn short_content_rejected() {
        let filter = SmartFilter::new(100, 50_000);
        let result = filter.check("Заголовок достаточной длины", "коротко", false);
        assert!(matches!(result, Err(Rejection::TooShort(_))));
    }

    #[test]
    fn duplicate_within_window_rejected() {
        let filter = SmartFilter::new(100, 50_000);
        let title = "Конференция по ИИ открылась в Белграде";
        assert!(filter.check(title, GOOD_BODY, false).is_ok());
        assert_eq!(
            filter.check(title, GOOD_BODY, false),
            Err(Rejection::DuplicateRecent)
        );
    }

    #[test]
    fn language_heuristic_accepts_russian_and_english() {
        let russian = "а".repeat(100);
        assert!(is_accepted_language(&russian));
        let english = "a".repeat(100);
        assert!(is_accepted_language(&english));
        // Half-and-half is the rejected mixed zone.
        let mixed = format!("{} {}", "а".repeat(50), "a".repeat(50));
        assert!(!is_accepted_language(&mixed));
        assert!(is_accepted_language("короткий текст"));
    }

    #[test]
    fn spam_patterns_rejected() {
        let filter = SmartFilter::new(10, 50_000);
        let result = filter.check(
            "Невероятное предложение сегодня",
            "Купи сейчас со скидкой, ограниченное время! Торопись, пока не поздно.",
            false,
        );
        assert!(matches!(result, Err(Rejection::Spam)));
    }

    #[test]
    fn ad_prefilter_flags_promo_text() {
        let signal = ad_prefilter(
            "🔥 КУПИ КУРС СЕЙЧАС",
            "Только сегодня скидка 70%! Промокод УСПЕХ. Заказать сейчас!",
            "http://buy.ex/?promo=1",
        );
        assert!(signal.flagged);
        assert!(signal.score >= 0.6);
        assert!(signal.markers.iter().any(|m| m.starts_with("strong_ad:")));
    }

    #[test]
    fn ad_prefilter_discounts_news_domains() {
        let text = "Министерство сообщило: по данным исследования, акция протеста собрала тысячи человек.";
        let from_news = ad_prefilter("Новости дня", text, "https://www.rts.rs/vesti/1");
        assert!(!from_news.flagged);
        assert!(from_news.markers.contains(&"source:news_domain".to_string()));
    }

    #[test]
    fn quality_score_penalizes_personal_services() {
        let ad = "Я программист, предлагаю услуги по разработке. Обращайтесь по телефону.";
        let news = GOOD_BODY;
        assert!(quality_score("Объявление об услугах", ad) < quality_score("Новость дня в регионе", news));
    }
}
