use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput};

/// Keyword table: (label, markers). First match wins on ties via higher hit
/// count, so ordering only matters for exact ties.
const DOMAINS: &[(&str, &[&str])] = &[
    (
        "distributed-systems",
        &[
            "consensus", "raft", "paxos", "replication", "quorum", "leader", "distributed",
            "partition", "gossip",
        ],
    ),
    (
        "databases",
        &["sql", "database", "index", "transaction", "btree", "storage", "schema"],
    ),
    (
        "machine-learning",
        &["model", "training", "neural", "embedding", "gradient", "dataset", "inference"],
    ),
    (
        "security",
        &["encryption", "tls", "vulnerability", "exploit", "authentication", "cipher"],
    ),
    (
        "mathematics",
        &["sum", "integral", "equation", "theorem", "prove", "derivative", "matrix"],
    ),
];

const MIN_CONFIDENCE: f64 = 0.15;

/// Pure classification over the query text. Never errors; anything the
/// table cannot place lands in `"general"` with low confidence.
pub struct DomainDetect;

#[async_trait]
impl Stage for DomainDetect {
    fn name(&self) -> &'static str {
        super::DOMAIN_DETECT
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn optional_input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_DOMAIN_HINT]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::DOMAIN_LABEL, keys::DOMAIN_CONFIDENCE]
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn run(
        &self,
        _ctx: &StageContext,
        view: ScratchpadView<'_>,
        _cfg: &Value,
    ) -> Result<StageOutput, StageError> {
        if let Some(hint) = view.opt_str(keys::QUERY_DOMAIN_HINT) {
            return Ok(StageOutput::new()
                .write(keys::DOMAIN_LABEL, json!(hint))
                .write(keys::DOMAIN_CONFIDENCE, json!(0.9)));
        }

        let text = view.require_str(keys::QUERY_TEXT)?;
        let (label, confidence) = classify(text);
        Ok(StageOutput::new()
            .write(keys::DOMAIN_LABEL, json!(label))
            .write(keys::DOMAIN_CONFIDENCE, json!(confidence)))
    }
}

fn classify(text: &str) -> (&'static str, f64) {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return ("general", 0.0);
    }

    let mut best: (&'static str, usize) = ("general", 0);
    for (label, markers) in DOMAINS {
        let hits = markers
            .iter()
            .filter(|marker| tokens.iter().any(|t| t == *marker))
            .count();
        if hits > best.1 {
            best = (label, hits);
        }
    }

    let confidence = (best.1 as f64 / tokens.len() as f64).min(1.0);
    if confidence < MIN_CONFIDENCE {
        ("general", confidence)
    } else {
        (best.0, confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_query_maps_to_distributed_systems() {
        let (label, confidence) = classify("Explain raft consensus leader election");
        assert_eq!(label, "distributed-systems");
        assert!(confidence >= MIN_CONFIDENCE);
    }

    #[test]
    fn unplaceable_query_is_general() {
        let (label, _) = classify("what should I eat for dinner tonight");
        assert_eq!(label, "general");
    }

    #[test]
    fn empty_text_is_general_with_zero_confidence() {
        let (label, confidence) = classify("??");
        assert_eq!(label, "general");
        assert_eq!(confidence, 0.0);
    }
}
