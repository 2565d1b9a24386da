//! Plan construction. The routing policy is a threshold table: rows gate on
//! the difficulty score and feature gates, rows that pass are emitted in
//! table order, and the prelude rows share a parallel group. Plans over the
//! stage budget shed rows in ascending marginal value; stages whose
//! producers were shed go with them.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use cascade_types::{Budget, Difficulty, StagePlan, StageSpec};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::keys;
use crate::pipeline::ExecuteOptions;
use crate::stage::StageRegistry;
use crate::stages;

const PRELUDE_GROUP: &str = "prelude";

/// Marginal value of the refinement row: explicitly requested, so it sheds
/// only after every difficulty-gated row.
const REFINE_MARGINAL: f64 = 0.95;

struct Row {
    stage: &'static str,
    marginal: f64,
    group: Option<&'static str>,
}

pub struct PlanRequest<'a> {
    pub difficulty: &'a Difficulty,
    pub domain_hint: Option<&'a str>,
    pub budget: &'a Budget,
    pub options: &'a ExecuteOptions,
    pub config: &'a EngineConfig,
    pub recursion_remaining: u32,
}

pub struct Router {
    registry: Arc<StageRegistry>,
}

impl Router {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self { registry }
    }

    /// Build the plan. The second return value reports whether rows were
    /// shed to fit `budget.max_stages`.
    pub fn build_plan(&self, req: &PlanRequest<'_>) -> Result<(StagePlan, bool), EngineError> {
        let rows = self.candidate_rows(req);
        let rows = apply_stage_lists(rows, req.options);
        let (rows, trimmed) = trim_to_stage_budget(rows, req.budget.max_stages);
        let specs = self.resolve(rows, req)?;
        Ok((StagePlan { stages: specs }, trimmed))
    }

    fn candidate_rows(&self, req: &PlanRequest<'_>) -> Vec<Row> {
        let score = req.difficulty.score;
        let thresholds = &req.config.router;
        let gates = &req.config.features;
        let mut rows = Vec::new();

        rows.push(Row {
            stage: stages::DOMAIN_DETECT,
            marginal: 0.0,
            group: Some(PRELUDE_GROUP),
        });
        if gates.expand && score >= thresholds.expand {
            rows.push(Row {
                stage: stages::QUERY_EXPAND,
                marginal: thresholds.expand,
                group: Some(PRELUDE_GROUP),
            });
        }
        if gates.memory {
            rows.push(Row {
                stage: stages::RETRIEVE,
                marginal: 0.0,
                group: Some(PRELUDE_GROUP),
            });
        }
        let teacher_passes = score >= thresholds.teacher;
        if gates.teacher && teacher_passes {
            rows.push(Row {
                stage: stages::TEACHER_CALL,
                marginal: thresholds.teacher,
                group: None,
            });
        }
        // Student runs as the teacher's fallback, or as the base generator
        // when the teacher gate is closed.
        if teacher_passes {
            rows.push(Row {
                stage: stages::STUDENT_CALL,
                marginal: thresholds.teacher,
                group: None,
            });
        }
        if gates.decompose && score >= thresholds.decompose {
            rows.push(Row {
                stage: stages::DECOMPOSE,
                marginal: thresholds.decompose,
                group: None,
            });
        }
        if gates.recurse && score >= thresholds.recurse && req.recursion_remaining > 0 {
            rows.push(Row {
                stage: stages::RECURSE,
                marginal: thresholds.recurse,
                group: None,
            });
        }
        if gates.context && score >= thresholds.context {
            rows.push(Row {
                stage: stages::CONTEXT_ASSEMBLY,
                marginal: thresholds.context,
                group: None,
            });
        }
        if gates.refine && req.options.needs_refinement {
            rows.push(Row {
                stage: stages::REFINE,
                marginal: REFINE_MARGINAL,
                group: None,
            });
        }
        rows.push(Row {
            stage: stages::SYNTHESIZE,
            marginal: f64::INFINITY,
            group: None,
        });

        rows
    }

    /// Turn surviving rows into validated StageSpecs: check producers,
    /// resolve readable keys, enforce disjoint writes inside groups.
    fn resolve(
        &self,
        rows: Vec<Row>,
        req: &PlanRequest<'_>,
    ) -> Result<Vec<StageSpec>, EngineError> {
        let mut available: HashSet<String> = HashSet::new();
        available.insert(keys::QUERY_TEXT.to_string());
        if req.domain_hint.is_some() {
            available.insert(keys::QUERY_DOMAIN_HINT.to_string());
        }

        let mut specs: Vec<StageSpec> = Vec::new();
        let mut index = 0;

        while index < rows.len() {
            // One group chunk at a time: either a run of rows sharing a tag
            // or a single untagged row.
            let group_tag = rows[index].group;
            let mut end = index + 1;
            if group_tag.is_some() {
                while end < rows.len() && rows[end].group == group_tag {
                    end += 1;
                }
            }

            let mut group_outputs: HashSet<String> = HashSet::new();
            let mut group_specs: Vec<StageSpec> = Vec::new();

            for row in &rows[index..end] {
                let stage = self.registry.get(row.stage).ok_or_else(|| {
                    EngineError::Planning(format!("stage `{}` is not registered", row.stage))
                })?;

                let missing: Vec<&str> = stage
                    .input_keys()
                    .iter()
                    .copied()
                    .filter(|key| !available.contains(*key))
                    .collect();
                if !missing.is_empty() {
                    // Producer was gated or shed; drop the dependent row the
                    // same way, unless it is the terminal stage.
                    if stage.required() {
                        return Err(EngineError::Planning(format!(
                            "terminal stage `{}` missing inputs: {}",
                            row.stage,
                            missing.join(", ")
                        )));
                    }
                    tracing::debug!(
                        target: "cascade.engine",
                        stage = row.stage,
                        missing = missing.join(","),
                        "eliding stage with unsatisfied inputs"
                    );
                    continue;
                }

                for output in stage.output_keys() {
                    if !group_outputs.insert((*output).to_string()) {
                        return Err(EngineError::Planning(format!(
                            "parallel group `{}` writes key `{}` from two stages",
                            group_tag.unwrap_or("-"),
                            output
                        )));
                    }
                }

                let mut input_keys: Vec<String> = stage
                    .input_keys()
                    .iter()
                    .map(|k| (*k).to_string())
                    .collect();
                for optional in stage.optional_input_keys() {
                    if available.contains(*optional) {
                        input_keys.push((*optional).to_string());
                    }
                }

                group_specs.push(StageSpec {
                    stage: row.stage.to_string(),
                    config: stage_config(row.stage, req.config),
                    input_keys,
                    output_keys: stage.output_keys().iter().map(|k| (*k).to_string()).collect(),
                    cacheable: stage.cacheable(),
                    idempotent: stage.idempotent(),
                    parallel_group: row.group.map(str::to_string),
                });
            }

            for spec in &group_specs {
                for output in &spec.output_keys {
                    available.insert(output.clone());
                }
            }
            specs.extend(group_specs);
            index = end;
        }

        Ok(specs)
    }
}

fn apply_stage_lists(rows: Vec<Row>, options: &ExecuteOptions) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| {
            if row.stage == stages::SYNTHESIZE {
                return true;
            }
            if let Some(allowed) = &options.enabled_stages {
                if !allowed.iter().any(|s| s == row.stage) {
                    return false;
                }
            }
            !options.disabled_stages.iter().any(|s| s == row.stage)
        })
        .collect()
}

/// Shed rows in ascending marginal value until the plan fits. The terminal
/// row is exempt: even `max_stages = 0` keeps synthesis.
fn trim_to_stage_budget(mut rows: Vec<Row>, max_stages: u32) -> (Vec<Row>, bool) {
    let mut trimmed = false;
    while rows.len() > max_stages as usize
        && rows.iter().any(|r| r.marginal.is_finite())
    {
        let victim = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.marginal.is_finite())
            .min_by(|a, b| {
                a.1.marginal
                    .partial_cmp(&b.1.marginal)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i);
        match victim {
            Some(index) => {
                rows.remove(index);
                trimmed = true;
            }
            None => break,
        }
    }
    (rows, trimmed)
}

fn stage_config(stage: &str, config: &EngineConfig) -> Value {
    match stage {
        stages::QUERY_EXPAND => json!({"max_variants": 3}),
        stages::RETRIEVE => json!({"k": 5}),
        stages::DECOMPOSE => json!({"max_steps": 5}),
        stages::RECURSE => json!({"max_steps": 3}),
        stages::REFINE => json!({"max_iterations": 4, "epsilon": 0.01}),
        stages::SYNTHESIZE => json!({"deny_patterns": &config.synthesize.deny_patterns}),
        _ => json!({}),
    }
}
