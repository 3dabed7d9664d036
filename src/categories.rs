//! Mapping of free-form AI category labels onto the fixed taxonomy.
//!
//! Resolution is deterministic given the mapping table: exact
//! case-insensitive match first, then a normalized form, then the default
//! category at reduced confidence with the label recorded for review.

use std::sync::Arc;

use tracing::debug;

use crate::dbqueue::DbQueue;
use crate::error::QueueError;
use crate::models::{CategoryMapping, CategoryScore};
use crate::store;

pub const MAX_CATEGORIES_PER_ARTICLE: usize = 3;

/// Confidence multiplier for labels that fell through to the default.
const UNMAPPED_CONFIDENCE_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCategory {
    pub name: String,
    pub confidence: f64,
    /// The AI label this category came from, when it was not a direct hit.
    pub mapped_from: Option<String>,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub categories: Vec<ResolvedCategory>,
    /// Labels with no mapping, recorded for admin review.
    pub unmapped: Vec<String>,
    /// Mapping rows that fired, for usage bookkeeping.
    pub used_mapping_ids: Vec<i64>,
}

/// Strip punctuation and separators so "Financial_News!" and
/// "financial news" resolve identically.
pub fn normalize_label(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '-' { ' ' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pure resolution over an in-memory mapping snapshot.
pub fn resolve_labels(
    scores: &[CategoryScore],
    mappings: &[CategoryMapping],
    fixed: &[String],
    default_category: &str,
) -> Resolution {
    let mut result = Resolution::default();

    for score in scores {
        let label = score.name.trim();
        if label.is_empty() {
            continue;
        }

        // Direct hit on the fixed taxonomy.
        if let Some(fixed_name) = fixed.iter().find(|f| f.eq_ignore_ascii_case(label)) {
            push_category(&mut result.categories, fixed_name.clone(), score.confidence, None);
            continue;
        }

        // Exact mapping, then normalized mapping.
        let normalized = normalize_label(label);
        let mapping = mappings
            .iter()
            .filter(|m| m.is_active)
            .find(|m| m.ai_category.eq_ignore_ascii_case(label))
            .or_else(|| {
                mappings
                    .iter()
                    .filter(|m| m.is_active)
                    .find(|m| normalize_label(&m.ai_category) == normalized)
            });

        match mapping {
            Some(m) if score.confidence >= m.confidence_threshold => {
                // A mapping pointing outside the taxonomy defers to the
                // default category.
                let target = fixed
                    .iter()
                    .find(|f| f.eq_ignore_ascii_case(&m.fixed_category))
                    .cloned();
                let (name, confidence) = match target {
                    Some(name) => (name, score.confidence),
                    None => {
                        result.unmapped.push(label.to_string());
                        (
                            default_category.to_string(),
                            score.confidence * UNMAPPED_CONFIDENCE_FACTOR,
                        )
                    }
                };
                result.used_mapping_ids.push(m.id);
                push_category(&mut result.categories, name, confidence, Some(label.to_string()));
            }
            _ => {
                // Normalized form may still equal a fixed category name.
                if let Some(fixed_name) = fixed.iter().find(|f| normalize_label(f) == normalized) {
                    push_category(
                        &mut result.categories,
                        fixed_name.clone(),
                        score.confidence,
                        Some(label.to_string()),
                    );
                    continue;
                }
                result.unmapped.push(label.to_string());
                push_category(
                    &mut result.categories,
                    default_category.to_string(),
                    score.confidence * UNMAPPED_CONFIDENCE_FACTOR,
                    Some(label.to_string()),
                );
            }
        }
    }

    if result.categories.is_empty() {
        result.categories.push(ResolvedCategory {
            name: default_category.to_string(),
            confidence: 0.3,
            mapped_from: None,
        });
    }

    // Confidence-descending, capped.
    result
        .categories
        .sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    result.categories.truncate(MAX_CATEGORIES_PER_ARTICLE);
    result
}

/// Dedup by name, keeping the highest confidence.
fn push_category(
    categories: &mut Vec<ResolvedCategory>,
    name: String,
    confidence: f64,
    mapped_from: Option<String>,
) {
    if let Some(existing) = categories.iter_mut().find(|c| c.name == name) {
        if confidence > existing.confidence {
            existing.confidence = confidence;
            existing.mapped_from = mapped_from;
        }
        return;
    }
    categories.push(ResolvedCategory {
        name,
        confidence,
        mapped_from,
    });
}

pub struct CategoryEngine {
    queue: Arc<DbQueue>,
    fixed: Vec<String>,
    default_category: String,
}

impl CategoryEngine {
    pub fn new(queue: Arc<DbQueue>, fixed: Vec<String>, default_category: String) -> Self {
        Self {
            queue,
            fixed,
            default_category,
        }
    }

    /// Resolve AI labels against the live mapping table, recording usage
    /// and unmapped labels as a side effect.
    pub async fn resolve(&self, scores: &[CategoryScore]) -> Result<Vec<ResolvedCategory>, QueueError> {
        let mappings = self
            .queue
            .read(|pool| Box::pin(async move { store::get_active_mappings(&pool).await }))
            .await?;

        let resolution = resolve_labels(scores, &mappings, &self.fixed, &self.default_category);

        if !resolution.unmapped.is_empty() || !resolution.used_mapping_ids.is_empty() {
            let unmapped = resolution.unmapped.clone();
            let used = resolution.used_mapping_ids.clone();
            let default_category = self.default_category.clone();
            debug!(unmapped = unmapped.len(), used = used.len(), "category mapping bookkeeping");
            self.queue
                .write(
                    "category_mapping",
                    Arc::new(move |conn| {
                        let unmapped = unmapped.clone();
                        let used = used.clone();
                        let default_category = default_category.clone();
                        Box::pin(async move {
                            for label in &unmapped {
                                store::record_unmapped_label(&mut *conn, label, &default_category)
                                    .await?;
                            }
                            for id in &used {
                                store::touch_mapping_usage(&mut *conn, *id).await?;
                            }
                            Ok(())
                        })
                    }),
                )
                .await?;
        }

        Ok(resolution.categories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(id: i64, ai: &str, fixed: &str) -> CategoryMapping {
        CategoryMapping {
            id,
            ai_category: ai.into(),
            fixed_category: fixed.into(),
            confidence_threshold: 0.0,
            is_active: true,
            usage_count: 0,
            last_used: None,
        }
    }

    fn fixed() -> Vec<String> {
        vec!["Business".into(), "Tech".into(), "Science".into(), "Other".into()]
    }

    fn score(name: &str, confidence: f64) -> CategoryScore {
        CategoryScore {
            name: name.into(),
            confidence,
        }
    }

    #[test]
    fn direct_fixed_category_resolves() {
        let r = resolve_labels(&[score("tech", 0.9)], &[], &fixed(), "Other");
        assert_eq!(r.categories.len(), 1);
        assert_eq!(r.categories[0].name, "Tech");
        assert!(r.unmapped.is_empty());
    }

    #[test]
    fn mapping_resolves_case_insensitively() {
        let mappings = vec![mapping(1, "financial_news", "Business")];
        let r = resolve_labels(&[score("Financial_News", 0.85)], &mappings, &fixed(), "Other");
        assert_eq!(r.categories[0].name, "Business");
        assert_eq!(r.categories[0].mapped_from.as_deref(), Some("Financial_News"));
        assert_eq!(r.used_mapping_ids, vec![1]);
    }

    #[test]
    fn normalized_form_matches_mapping() {
        let mappings = vec![mapping(2, "financial news", "Business")];
        let r = resolve_labels(&[score("Financial-News!", 0.8)], &mappings, &fixed(), "Other");
        assert_eq!(r.categories[0].name, "Business");
    }

    #[test]
    fn unmapped_label_falls_to_default_with_reduced_confidence() {
        let r = resolve_labels(&[score("quantum_gardening", 0.9)], &[], &fixed(), "Other");
        assert_eq!(r.categories[0].name, "Other");
        assert!((r.categories[0].confidence - 0.45).abs() < 1e-9);
        assert_eq!(r.unmapped, vec!["quantum_gardening"]);
    }

    #[test]
    fn mapping_to_missing_fixed_category_defers_to_default() {
        let mappings = vec![mapping(3, "crypto", "Cryptocurrency")];
        let r = resolve_labels(&[score("crypto", 0.9)], &mappings, &fixed(), "Other");
        assert_eq!(r.categories[0].name, "Other");
        assert_eq!(r.unmapped, vec!["crypto"]);
    }

    #[test]
    fn below_threshold_mapping_is_skipped() {
        let mut m = mapping(4, "markets", "Business");
        m.confidence_threshold = 0.9;
        let r = resolve_labels(&[score("markets", 0.5)], &[m], &fixed(), "Other");
        assert_eq!(r.categories[0].name, "Other");
    }

    #[test]
    fn dedup_keeps_highest_confidence_and_caps_at_three() {
        let mappings = vec![
            mapping(5, "fintech", "Business"),
            mapping(6, "banking", "Business"),
        ];
        let scores = [
            score("fintech", 0.6),
            score("banking", 0.9),
            score("Tech", 0.8),
            score("Science", 0.7),
            score("unknown_one", 0.95),
        ];
        let r = resolve_labels(&scores, &mappings, &fixed(), "Other");
        assert_eq!(r.categories.len(), MAX_CATEGORIES_PER_ARTICLE);
        let business = r.categories.iter().find(|c| c.name == "Business").unwrap();
        assert!((business.confidence - 0.9).abs() < 1e-9);
        // Confidence-descending order.
        assert!(r.categories.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    }

    #[test]
    fn empty_scores_get_the_default() {
        let r = resolve_labels(&[], &[], &fixed(), "Other");
        assert_eq!(r.categories.len(), 1);
        assert_eq!(r.categories[0].name, "Other");
        assert!((r.categories[0].confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn resolution_is_deterministic() {
        let mappings = vec![mapping(1, "markets", "Business")];
        let scores = [score("markets", 0.8), score("Tech", 0.7)];
        let a = resolve_labels(&scores, &mappings, &fixed(), "Other");
        let b = resolve_labels(&scores, &mappings, &fixed(), "Other");
        assert_eq!(a.categories, b.categories);
    }
}
