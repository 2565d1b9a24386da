use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput};

const DEFAULT_MAX_STEPS: usize = 5;

const COMPUTE_MARKERS: &[&str] = &["calculate", "compute", "sum", "count", "convert", "solve"];
const RESEARCH_MARKERS: &[&str] = &[
    "explain", "describe", "compare", "find", "research", "cite", "summarize", "list",
];

/// Deterministic structural decomposition: the query splits on sentence and
/// conjunction boundaries into ordered sub-steps, each tagged with a rough
/// kind. Same input, same steps.
pub struct Decompose;

#[async_trait]
impl Stage for Decompose {
    fn name(&self) -> &'static str {
        super::DECOMPOSE
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::DECOMPOSE_STEPS]
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn run(
        &self,
        _ctx: &StageContext,
        view: ScratchpadView<'_>,
        cfg: &Value,
    ) -> Result<StageOutput, StageError> {
        let query = view.require_str(keys::QUERY_TEXT)?;
        let max_steps = cfg["max_steps"].as_u64().unwrap_or(DEFAULT_MAX_STEPS as u64) as usize;

        let steps = split_steps(query, max_steps);
        Ok(StageOutput::new().write(keys::DECOMPOSE_STEPS, json!(steps)))
    }
}

fn split_steps(query: &str, max_steps: usize) -> Vec<Value> {
    let mut goals: Vec<String> = Vec::new();
    for sentence in query.split(['.', ';', '!', '?']) {
        for goal in split_conjunctions(sentence) {
            if goal.split_whitespace().count() >= 2 {
                goals.push(goal);
            }
        }
    }
    if goals.is_empty() {
        goals.push(query.trim().to_string());
    }
    goals.truncate(max_steps.max(1));

    goals
        .into_iter()
        .enumerate()
        .map(|(index, goal)| {
            json!({
                "index": index,
                "goal": goal,
                "kind": classify(&goal),
            })
        })
        .collect()
}

/// `then` always opens a new step; a comma does only when the fragment
/// leads with an action verb ("..., cite sources"). Plain list commas stay
/// attached to the step they belong to.
fn split_conjunctions(sentence: &str) -> Vec<String> {
    let normalized = sentence.replace(" and then ", " then ");
    let mut goals: Vec<String> = Vec::new();
    for chunk in normalized.split(" then ") {
        let mut chunk_open = false;
        for fragment in chunk.split(',') {
            let trimmed = fragment.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !chunk_open || starts_with_action_verb(trimmed) {
                goals.push(trimmed.to_string());
                chunk_open = true;
            } else if let Some(last) = goals.last_mut() {
                last.push_str(", ");
                last.push_str(trimmed);
            }
        }
    }
    goals
}

fn starts_with_action_verb(fragment: &str) -> bool {
    let first = fragment
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    COMPUTE_MARKERS.contains(&first.as_str()) || RESEARCH_MARKERS.contains(&first.as_str())
}

fn classify(goal: &str) -> &'static str {
    let lower = goal.to_lowercase();
    if COMPUTE_MARKERS.iter().any(|m| lower.contains(m))
        || goal.chars().filter(|c| c.is_ascii_digit()).count() >= 2
    {
        "compute"
    } else if RESEARCH_MARKERS.iter().any(|m| lower.contains(m)) {
        "research"
    } else {
        "answer"
    }
}
