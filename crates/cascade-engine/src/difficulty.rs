//! Difficulty estimation: an explicit weighted sum over query features
//! followed by a logistic squash. Pure and deterministic for a given input
//! and weight set; thresholds elsewhere compare with `>=` so ties break
//! toward the harder plan.

use cascade_types::{Difficulty, DifficultyFeatures};

use crate::config::DifficultyWeights;

/// Action verbs whose co-occurrence marks a multi-intent query.
const INTENT_MARKERS: &[&str] = &[
    "explain", "describe", "compare", "list", "cite", "summarize", "summarise", "analyze",
    "analyse", "implement", "design", "evaluate", "prove", "derive", "translate",
];

pub struct DifficultyEstimator {
    weights: DifficultyWeights,
}

impl DifficultyEstimator {
    pub fn new(weights: DifficultyWeights) -> Self {
        Self { weights }
    }

    pub fn estimate(
        &self,
        text: &str,
        domain_hint: Option<&str>,
        context_len: usize,
    ) -> Difficulty {
        let features = extract_features(text, domain_hint, context_len);
        let w = &self.weights;

        let raw = w.bias
            + w.tokens * normalize(features.token_count, 400)
            + w.entities * normalize(features.entity_count, 8)
            + w.multi_intent * f64::from(u8::from(features.multi_intent))
            + w.domain_uncertainty * f64::from(u8::from(features.domain_uncertain))
            + w.context * normalize(features.context_len, 16 * 1024);

        Difficulty::new(logistic(raw), features)
    }
}

fn extract_features(
    text: &str,
    domain_hint: Option<&str>,
    context_len: usize,
) -> DifficultyFeatures {
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let entity_count = tokens
        .iter()
        .enumerate()
        .filter(|(index, token)| is_entity_token(token, *index == 0))
        .count();

    let lower = text.to_lowercase();
    let marker_hits = INTENT_MARKERS
        .iter()
        .filter(|marker| contains_word(&lower, marker))
        .count();
    let question_marks = text.matches('?').count();
    let multi_intent =
        marker_hits >= 2 || question_marks >= 2 || lower.contains("; ") || lower.contains(" and then ");

    DifficultyFeatures {
        token_count: tokens.len(),
        entity_count,
        multi_intent,
        domain_uncertain: domain_hint.map(str::trim).filter(|h| !h.is_empty()).is_none(),
        context_len,
    }
}

fn is_entity_token(token: &str, sentence_start: bool) -> bool {
    let stripped: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
    if stripped.len() < 2 {
        return false;
    }
    let all_caps = stripped.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        && stripped.chars().any(|c| c.is_ascii_uppercase());
    if all_caps {
        return true;
    }
    if sentence_start {
        return false;
    }
    stripped
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|t| t == word)
}

fn normalize(value: usize, cap: usize) -> f64 {
    (value.min(cap) as f64) / (cap as f64)
}

fn logistic(raw: f64) -> f64 {
    1.0 / (1.0 + (-raw).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DifficultyWeights;

    fn estimator() -> DifficultyEstimator {
        DifficultyEstimator::new(DifficultyWeights::default())
    }

    #[test]
    fn trivial_arithmetic_scores_low() {
        let difficulty = estimator().estimate("2+2=?", None, 0);
        assert!(difficulty.score < 0.3, "got {}", difficulty.score);
        assert!(!difficulty.features.multi_intent);
    }

    #[test]
    fn multi_intent_entity_query_scores_high() {
        let difficulty = estimator().estimate("Explain RAFT consensus, cite sources", None, 0);
        assert!(difficulty.score >= 0.6, "got {}", difficulty.score);
        assert!(difficulty.features.multi_intent);
        assert!(difficulty.features.entity_count >= 1);
    }

    #[test]
    fn domain_hint_lowers_difficulty() {
        let uncertain = estimator().estimate("Explain RAFT consensus, cite sources", None, 0);
        let hinted = estimator().estimate(
            "Explain RAFT consensus, cite sources",
            Some("distributed-systems"),
            0,
        );
        assert!(hinted.score < uncertain.score);
        assert!(!hinted.features.domain_uncertain);
    }

    #[test]
    fn estimate_is_deterministic() {
        let a = estimator().estimate("Compare Paxos and Raft", None, 120);
        let b = estimator().estimate("Compare Paxos and Raft", None, 120);
        assert_eq!(a.score, b.score);
    }

    #[test]
    fn attached_context_raises_difficulty() {
        let bare = estimator().estimate("Summarize this document", None, 0);
        let with_context = estimator().estimate("Summarize this document", None, 12_000);
        assert!(with_context.score > bare.score);
    }
}
