use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput};

/// Terminal composition. Candidate priority is fixed: refined > teacher >
/// student > retrieval summary; candidates matching a deny pattern are
/// rejected and the next source is tried. Always produces an answer, even
/// when every upstream stage degraded.
pub struct Synthesize;

#[async_trait]
impl Stage for Synthesize {
    fn name(&self) -> &'static str {
        super::SYNTHESIZE
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn optional_input_keys(&self) -> &'static [&'static str] {
        &[
            keys::REFINE_FINAL,
            keys::TEACHER_ANSWER,
            keys::STUDENT_ANSWER,
            keys::RETRIEVAL_NOTES,
            keys::RECURSE_STEP_RESULTS,
            keys::DOMAIN_LABEL,
            keys::CONTEXT_PLAYBOOK,
        ]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::FINAL_ANSWER, keys::FINAL_PROVENANCE]
    }

    fn required(&self) -> bool {
        true
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
        let deny = compile_deny_patterns(cfg);
        let notes = view
            .opt_array(keys::RETRIEVAL_NOTES)
            .cloned()
            .unwrap_or_default();

        let mut candidates: Vec<(String, String)> = Vec::new();
        for (key, source) in [
            (keys::REFINE_FINAL, super::REFINE),
            (keys::TEACHER_ANSWER, super::TEACHER_CALL),
            (keys::STUDENT_ANSWER, super::STUDENT_CALL),
        ] {
            if let Some(answer) = view.opt_str(key) {
                if !answer.trim().is_empty() {
                    candidates.push((source.to_string(), answer.to_string()));
                }
            }
        }
        if let Some(summary) = retrieval_summary(&notes) {
            candidates.push((super::RETRIEVE.to_string(), summary));
        }

        let mut rejected = 0usize;
        let chosen = candidates.into_iter().find(|(_, answer)| {
            let denied = deny.iter().any(|p| p.is_match(answer));
            if denied {
                rejected += 1;
            }
            !denied
        });

        let (mut answer, source, mut notes_out) = match chosen {
            Some((source, answer)) => (answer, Some(source), None),
            None => {
                let message = match &ctx.degradation {
                    Some(reason) => format!("Degraded answer: {reason}."),
                    None => "Degraded answer: no grounded answer could be produced for this query."
                        .to_string(),
                };
                (message, None, Some("degraded: no usable candidate".to_string()))
            }
        };

        if rejected > 0 {
            let flagged = format!("{rejected} candidate(s) rejected by deny patterns");
            notes_out = Some(match notes_out {
                Some(existing) => format!("{existing}; {flagged}"),
                None => flagged,
            });
        }

        if let Some(reason) = &ctx.degradation {
            if source.is_some() {
                answer.push_str(&format!("\n\n(Note: {reason}.)"));
            }
        }

        let mut provenance: Vec<String> = Vec::new();
        if let Some(source) = &source {
            provenance.push(source.clone());
        }
        if !notes.is_empty() && source.as_deref() != Some(super::RETRIEVE) {
            provenance.push(super::RETRIEVE.to_string());
        }
        if view.opt_str(keys::CONTEXT_PLAYBOOK).is_some() {
            provenance.push(super::CONTEXT_ASSEMBLY.to_string());
        }
        if view
            .opt_array(keys::RECURSE_STEP_RESULTS)
            .is_some_and(|r| !r.is_empty())
        {
            provenance.push(super::RECURSE.to_string());
        }

        let mut output = StageOutput::new()
            .write(keys::FINAL_ANSWER, json!(answer))
            .write(keys::FINAL_PROVENANCE, json!(provenance));
        if let Some(notes_out) = notes_out {
            output = output.with_notes(notes_out);
        }
        Ok(output)
    }
}

fn compile_deny_patterns(cfg: &Value) -> Vec<Regex> {
    cfg["deny_patterns"]
        .as_array()
        .map(|patterns| {
            patterns
                .iter()
                .filter_map(|p| p.as_str())
                .filter_map(|p| match Regex::new(p) {
                    Ok(regex) => Some(regex),
                    Err(err) => {
                        tracing::warn!(
                            target: "cascade.engine",
                            pattern = p,
                            "ignoring invalid deny pattern: {err}"
                        );
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn retrieval_summary(notes: &[Value]) -> Option<String> {
    let lines: Vec<String> = notes
        .iter()
        .take(3)
        .filter_map(|n| {
            let text = n["text"].as_str()?;
            let id = n["id"].as_str().unwrap_or("?");
            Some(format!("- {text} [{id}]"))
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!(
        "Based on stored notes, the most relevant material:\n{}",
        lines.join("\n")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_patterns_compile_and_match() {
        let cfg = json!({"deny_patterns": [r"(?i)as an ai model", "broken(regex"]});
        let patterns = compile_deny_patterns(&cfg);
        assert_eq!(patterns.len(), 1, "invalid patterns are ignored");
        assert!(patterns[0].is_match("As an AI model, I cannot"));
    }

    #[test]
    fn retrieval_summary_takes_top_notes() {
        let notes = vec![
            json!({"id": "n1", "text": "alpha"}),
            json!({"id": "n2", "text": "beta"}),
            json!({"id": "n3", "text": "gamma"}),
            json!({"id": "n4", "text": "delta"}),
        ];
        let summary = retrieval_summary(&notes).unwrap();
        assert!(summary.contains("alpha [n1]"));
        assert!(!summary.contains("delta"));
    }

    #[test]
    fn empty_notes_have_no_summary() {
        assert!(retrieval_summary(&[]).is_none());
    }
}
