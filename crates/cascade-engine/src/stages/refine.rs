use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput};

const DEFAULT_MAX_ITERATIONS: usize = 4;
const DEFAULT_EPSILON: f64 = 0.01;

/// Iterative answer improvement against a fixed scoring function
/// (relevance, groundedness, completeness). Each pass folds in the
/// strongest not-yet-cited grounding note; iteration stops at the cap or
/// when the score delta falls under epsilon.
pub struct Refine;

#[async_trait]
impl Stage for Refine {
    fn name(&self) -> &'static str {
        super::REFINE
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn optional_input_keys(&self) -> &'static [&'static str] {
        &[
            keys::TEACHER_ANSWER,
            keys::STUDENT_ANSWER,
            keys::RETRIEVAL_NOTES,
            keys::CONTEXT_PLAYBOOK,
        ]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::REFINE_FINAL, keys::REFINE_SCORE_HISTORY]
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &StageContext,
        view: ScratchpadView<'_>,
        cfg: &Value,
    ) -> Result<StageOutput, StageError> {
        let query = view.require_str(keys::QUERY_TEXT)?;
        let max_iterations = cfg["max_iterations"]
            .as_u64()
            .unwrap_or(DEFAULT_MAX_ITERATIONS as u64) as usize;
        let epsilon = cfg["epsilon"].as_f64().unwrap_or(DEFAULT_EPSILON);

        let candidate = view
            .opt_str(keys::TEACHER_ANSWER)
            .filter(|a| !a.trim().is_empty())
            .or_else(|| view.opt_str(keys::STUDENT_ANSWER).filter(|a| !a.trim().is_empty()));
        let Some(candidate) = candidate else {
            return Err(StageError::invalid("no candidate answer to refine"));
        };

        let notes = view
            .opt_array(keys::RETRIEVAL_NOTES)
            .cloned()
            .unwrap_or_default();

        let mut current = candidate.to_string();
        let mut history = vec![score(&current, query, &notes)];

        for _ in 0..max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            let Some(improved) = improve(&current, &notes) else {
                break;
            };
            let improved_score = score(&improved, query, &notes);
            let last = *history.last().unwrap_or(&0.0);
            if improved_score - last < epsilon {
                break;
            }
            history.push(improved_score);
            current = improved;
        }

        Ok(StageOutput::new()
            .write(keys::REFINE_FINAL, json!(current))
            .write(keys::REFINE_SCORE_HISTORY, json!(history)))
    }
}

/// Weighted score in [0,1]: term overlap with the query, grounding against
/// retrieved notes, and a length-based completeness term.
fn score(answer: &str, query: &str, notes: &[Value]) -> f64 {
    0.5 * relevance(answer, query) + 0.3 * groundedness(answer, notes) + 0.2 * completeness(answer)
}

fn relevance(answer: &str, query: &str) -> f64 {
    let answer_tokens = token_set(answer);
    let query_tokens = token_set(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let overlap = query_tokens
        .iter()
        .filter(|t| answer_tokens.contains(*t))
        .count();
    overlap as f64 / query_tokens.len() as f64
}

fn groundedness(answer: &str, notes: &[Value]) -> f64 {
    if notes.is_empty() {
        // Nothing to ground against; score the midpoint rather than punish.
        return 0.5;
    }
    let answer_tokens = token_set(answer);
    let grounded = notes
        .iter()
        .filter_map(|n| n["text"].as_str())
        .filter(|text| {
            token_set(text)
                .iter()
                .filter(|t| answer_tokens.contains(*t))
                .count()
                >= 2
        })
        .count();
    grounded as f64 / notes.len() as f64
}

fn completeness(answer: &str) -> f64 {
    (answer.split_whitespace().count() as f64 / 40.0).min(1.0)
}

/// Fold the strongest note the answer does not reference yet into a
/// sources section. None when every note is already represented.
fn improve(answer: &str, notes: &[Value]) -> Option<String> {
    let answer_tokens = token_set(answer);
    let missing = notes.iter().find(|n| {
        n["text"].as_str().is_some_and(|text| {
            token_set(text)
                .iter()
                .filter(|t| answer_tokens.contains(*t))
                .count()
                < 2
        })
    })?;

    let id = missing["id"].as_str().unwrap_or("?");
    let text = missing["text"].as_str().unwrap_or_default();
    if answer.contains("Sources:") {
        Some(format!("{answer}\n[{id}] {text}"))
    } else {
        Some(format!("{answer}\n\nSources:\n[{id}] {text}"))
    }
}

fn token_set(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_rewards_query_overlap() {
        let high = score("raft consensus elects a leader", "raft consensus", &[]);
        let low = score("bread rises with yeast", "raft consensus", &[]);
        assert!(high > low);
    }

    #[test]
    fn improve_appends_uncited_note_once() {
        let notes = vec![json!({"id": "n1", "text": "raft uses randomized election timeouts"})];
        let improved = improve("Raft elects a leader.", &notes).unwrap();
        assert!(improved.contains("Sources:"));
        assert!(improved.contains("randomized election timeouts"));

        // Once folded in, there is nothing further to add.
        assert!(improve(&improved, &notes).is_none());
    }

    #[test]
    fn groundedness_is_midpoint_without_notes() {
        assert_eq!(groundedness("anything", &[]), 0.5);
    }
}
