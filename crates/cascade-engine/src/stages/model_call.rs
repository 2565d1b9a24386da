use async_trait::async_trait;
use serde_json::{json, Value};

use cascade_clients::GenerateOptions;
use cascade_types::ModelRole;

use crate::error::StageError;
use crate::keys;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput, CAP_NEEDS_STUDENT, CAP_NEEDS_TEACHER};

/// Teacher and student calls share one implementation; the two registry
/// entries differ in client identity, output keys and fallback behavior.
/// Re-issuing a generation with the same prompt is semantically safe, so
/// both are idempotent and eligible for scheduler retries.
pub struct ModelCall {
    name: &'static str,
    client: &'static str,
    role: ModelRole,
    answer_key: &'static str,
    optional_inputs: &'static [&'static str],
    outputs: &'static [&'static str],
    capabilities: &'static [&'static str],
}

impl ModelCall {
    pub fn teacher() -> Self {
        Self {
            name: super::TEACHER_CALL,
            client: "teacher",
            role: ModelRole::Teacher,
            answer_key: keys::TEACHER_ANSWER,
            optional_inputs: &[keys::RETRIEVAL_NOTES],
            outputs: &[keys::TEACHER_ANSWER, keys::TEACHER_CITATIONS],
            capabilities: &[CAP_NEEDS_TEACHER],
        }
    }

    pub fn student() -> Self {
        Self {
            name: super::STUDENT_CALL,
            client: "student",
            role: ModelRole::Student,
            answer_key: keys::STUDENT_ANSWER,
            optional_inputs: &[keys::RETRIEVAL_NOTES, keys::TEACHER_ANSWER],
            outputs: &[keys::STUDENT_ANSWER],
            capabilities: &[CAP_NEEDS_STUDENT],
        }
    }

    fn emits_citations(&self) -> bool {
        self.role == ModelRole::Teacher
    }
}

#[async_trait]
impl Stage for ModelCall {
    fn name(&self) -> &'static str {
        self.name
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::QUERY_TEXT]
    }

    fn optional_input_keys(&self) -> &'static [&'static str] {
        self.optional_inputs
    }

    fn output_keys(&self) -> &'static [&'static str] {
        self.outputs
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn capabilities(&self) -> &'static [&'static str] {
        self.capabilities
    }

    async fn run(
        &self,
        ctx: &StageContext,
        view: ScratchpadView<'_>,
        _cfg: &Value,
    ) -> Result<StageOutput, StageError> {
        let query = view.require_str(keys::QUERY_TEXT)?;

        // The student is the teacher's fallback: when a teacher answer
        // already landed there is nothing left to generate.
        if self.role == ModelRole::Student {
            if let Some(answer) = view.opt_str(keys::TEACHER_ANSWER) {
                if !answer.trim().is_empty() {
                    return Ok(StageOutput::new()
                        .with_notes("teacher answer present; student call skipped"));
                }
            }
        }

        let notes = view.opt_array(keys::RETRIEVAL_NOTES).cloned().unwrap_or_default();
        let prompt = assemble_prompt(query, &notes);
        let opts = GenerateOptions {
            timeout_ms: ctx.remaining_wall_ms().clamp(1, 30_000),
            ..GenerateOptions::default()
        };

        let generation = ctx
            .clients
            .generate(self.client, &prompt, &opts, &ctx.budget)
            .await?;

        let mut output = StageOutput::new()
            .write(self.answer_key, json!(generation.text))
            .with_usage(
                generation.cost_micros,
                generation.tokens_in,
                generation.tokens_out,
            );
        if self.emits_citations() {
            let citations: Vec<&str> = notes
                .iter()
                .filter_map(|n| n["id"].as_str())
                .collect();
            output = output.write(keys::TEACHER_CITATIONS, json!(citations));
        }
        Ok(output)
    }
}

fn assemble_prompt(query: &str, notes: &[Value]) -> String {
    let mut prompt = String::from(
        "Answer the question. Ground the answer in the notes when they are relevant, \
         and cite note ids in square brackets.\n",
    );
    if !notes.is_empty() {
        prompt.push_str("\nNotes:\n");
        for note in notes {
            let id = note["id"].as_str().unwrap_or("?");
            let text = note["text"].as_str().unwrap_or("");
            prompt.push_str(&format!("[{id}] {text}\n"));
        }
    }
    prompt.push_str(&format!("\nQuestion: {query}"));
    prompt
}
