use async_trait::async_trait;
use serde_json::{json, Value};

use cascade_types::Budget;

use crate::error::StageError;
use crate::keys;
use crate::pipeline::ExecuteOptions;
use crate::scratchpad::ScratchpadView;
use crate::stage::{Stage, StageContext, StageOutput, CAP_NEEDS_RECURSION};

const DEFAULT_MAX_STEPS: usize = 3;

/// Execute decomposition steps through a restricted sub-pipeline: a slice
/// of the remaining budget each, one less recursion level, no teacher. A
/// failed step records its terminal state and the walk continues.
pub struct Recurse;

#[async_trait]
impl Stage for Recurse {
    fn name(&self) -> &'static str {
        super::RECURSE
    }

    fn input_keys(&self) -> &'static [&'static str] {
        &[keys::DECOMPOSE_STEPS]
    }

    fn output_keys(&self) -> &'static [&'static str] {
        &[keys::RECURSE_STEP_RESULTS]
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &[CAP_NEEDS_RECURSION]
    }

    async fn run(
        &self,
        ctx: &StageContext,
        view: ScratchpadView<'_>,
        cfg: &Value,
    ) -> Result<StageOutput, StageError> {
        let Some(handle) = &ctx.recursion else {
            return Ok(StageOutput::new()
                .write(keys::RECURSE_STEP_RESULTS, json!([]))
                .with_notes("recursion not available"));
        };

        let max_steps = cfg["max_steps"].as_u64().unwrap_or(DEFAULT_MAX_STEPS as u64) as usize;
        let steps: Vec<Value> = view
            .get_array(keys::DECOMPOSE_STEPS)?
            .cloned()
            .unwrap_or_default();
        let steps: Vec<&Value> = steps.iter().take(max_steps.max(1)).collect();
        if steps.is_empty() {
            return Ok(StageOutput::new()
                .write(keys::RECURSE_STEP_RESULTS, json!([]))
                .with_notes("no steps to recurse into"));
        }

        let share = steps.len() as u64;
        let sub_budget = Budget {
            max_wall_ms: (ctx.remaining_wall_ms() / share).max(50),
            max_cost_micros: ctx.budget.remaining_cost_micros() / share,
            max_teacher_calls: 0,
            max_student_calls: 2,
            max_stages: 6,
        };

        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            let goal = step["goal"].as_str().unwrap_or_default();
            if goal.is_empty() {
                continue;
            }

            let options = ExecuteOptions {
                budget: Some(sub_budget.clone()),
                recursion_depth_max: Some(handle.remaining_depth.saturating_sub(1)),
                trace: false,
                deterministic_seed: ctx.seed,
                tenant_id: Some(ctx.tenant_id.clone()),
                ..ExecuteOptions::default()
            };

            match handle.executor.execute_sub(goal.to_string(), options).await {
                Ok(result) => {
                    results.push(json!({
                        "step": step["index"],
                        "goal": goal,
                        "answer": result.answer,
                        "terminal_state": result.terminal_state,
                    }));
                }
                Err(err) => {
                    tracing::debug!(
                        target: "cascade.engine",
                        goal,
                        "sub-pipeline step failed: {err}"
                    );
                    results.push(json!({
                        "step": step["index"],
                        "goal": goal,
                        "answer": "",
                        "terminal_state": "failed",
                    }));
                }
            }
        }

        Ok(StageOutput::new().write(keys::RECURSE_STEP_RESULTS, json!(results)))
    }
}
