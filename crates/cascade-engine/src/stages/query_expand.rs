use async_trait::async_trait;
use serde_json::{json, Value};

use cascade_clients::GenerateOptions;

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput, CAP_NEEDS_STUDENT};

const DEFAULT_MAX_VARIANTS: usize = 3;

/// Paraphrase the query into retrieval variants using the student client.
/// Model failure degrades to the original query alone; this stage never
/// fails the plan.
pub struct QueryExpand;

#[async_trait]
impl Stage for QueryExpand {
    fn name(&self) -> &'static str {
        super::QUERY_EXPAND
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::EXPAND_VARIANTS]
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &[CAP_NEEDS_STUDENT]
    }

    async fn run(
        &self,
        ctx: &StageContext,
        view: ScratchpadView<'_>,
        cfg: &Value,
    ) -> Result<StageOutput, StageError> {
        let query = view.require_str(keys::QUERY_TEXT)?;
        let max_variants = cfg["max_variants"].as_u64().unwrap_or(DEFAULT_MAX_VARIANTS as u64) as usize;

        let prompt = format!(
            "Rewrite the question below in {max_variants} different ways that keep its meaning. \
             Output one rewrite per line with no numbering.\n\nQuestion: {query}"
        );
        let opts = GenerateOptions {
            max_tokens: 256,
            timeout_ms: ctx.remaining_wall_ms().clamp(1, 10_000),
            ..GenerateOptions::default()
        };

        match ctx.clients.generate("student", &prompt, &opts, &ctx.budget).await {
            Ok(generation) => {
                let variants = collect_variants(query, &generation.text, max_variants);
                Ok(StageOutput::new()
                    .write(keys::EXPAND_VARIANTS, json!(variants))
                    .with_usage(generation.cost_micros, generation.tokens_in, generation.tokens_out))
            }
            Err(err) => {
                tracing::debug!(
                    target: "cascade.engine",
                    kind = err.kind(),
                    "query expansion degraded to original query: {err}"
                );
                Ok(StageOutput::new()
                    .write(keys::EXPAND_VARIANTS, json!([query]))
                    .with_notes(format!("expansion degraded: {}", err.kind())))
            }
        }
    }
}

fn collect_variants(original: &str, response: &str, max_variants: usize) -> Vec<String> {
    let mut variants = vec![original.to_string()];
    for line in response.lines() {
        let candidate = line
            .trim()
            .trim_start_matches(['-', '*', '•'])
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
            .trim();
        if candidate.is_empty() {
            continue;
        }
        if variants.iter().any(|v| v.eq_ignore_ascii_case(candidate)) {
            continue;
        }
        variants.push(candidate.to_string());
        if variants.len() > max_variants {
            break;
        }
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_keep_original_first_and_dedupe() {
        let variants = collect_variants(
            "how does raft work",
            "1. How does the raft protocol work\n- how does raft work\nWhat is the raft algorithm",
            3,
        );
        assert_eq!(variants[0], "how does raft work");
        assert_eq!(variants.len(), 3);
        assert!(variants.iter().any(|v| v.contains("protocol")));
    }

    #[test]
    fn blank_response_degrades_to_original() {
        let variants = collect_variants("q", "\n\n", 3);
        assert_eq!(variants, vec!["q".to_string()]);
    }
}
