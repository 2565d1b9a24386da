use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput};

/// Assemble a playbook block for downstream refinement and synthesis:
/// domain framing, the decomposition outline, and the strongest grounding
/// notes. Pure over its inputs.
pub struct ContextAssembly;

#[async_trait]
impl Stage for ContextAssembly {
    fn name(&self) -> &'static str {
        super::CONTEXT_ASSEMBLY
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn optional_input_keys(&self) -> &'static [&'static str] {
        &[keys::DOMAIN_LABEL, keys::RETRIEVAL_NOTES, keys::DECOMPOSE_STEPS]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::CONTEXT_PLAYBOOK]
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
        let query = view.require_str(keys::QUERY_TEXT)?;
        let mut sections = Vec::new();

        if let Some(domain) = view.opt_str(keys::DOMAIN_LABEL) {
            sections.push(format!("Domain: {domain}"));
        }

        if let Some(steps) = view.opt_array(keys::DECOMPOSE_STEPS) {
            if !steps.is_empty() {
                let outline: Vec<String> = steps
                    .iter()
                    .filter_map(|s| s["goal"].as_str())
                    .enumerate()
                    .map(|(i, goal)| format!("{}. {goal}", i + 1))
                    .collect();
                sections.push(format!("Approach:\n{}", outline.join("\n")));
            }
        }

        if let Some(notes) = view.opt_array(keys::RETRIEVAL_NOTES) {
            let grounding: Vec<String> = notes
                .iter()
                .take(3)
                .filter_map(|n| n["text"].as_str())
                .map(|text| format!("- {text}"))
                .collect();
            if !grounding.is_empty() {
                sections.push(format!("Grounding:\n{}", grounding.join("\n")));
            }
        }

        sections.push(format!("Task: {query}"));

        Ok(StageOutput::new().write(keys::CONTEXT_PLAYBOOK, json!(sections.join("\n\n"))))
    }
}
