use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use cascade_clients::ClientRegistry;
use cascade_memory::MemoryBank;
use cascade_types::{BudgetMeter, Clock, PipelineResult};

use crate::error::{EngineError, StageError};
use crate::pipeline::ExecuteOptions;
use crate::scratchpad::ScratchpadView;

/// Capability tags a stage may declare.
pub const CAP_NEEDS_TEACHER: &str = "needs-teacher";
pub const CAP_NEEDS_STUDENT: &str = "needs-student";
pub const CAP_NEEDS_MEMORY: &str = "needs-memory";
pub const CAP_NEEDS_RECURSION: &str = "needs-recursion";

/// Restricted re-entry into the pipeline, handed to the recursion stage.
#[async_trait]
pub trait SubExecutor: Send + Sync {
    async fn execute_sub(
        &self,
        text: String,
        options: ExecuteOptions,
    ) -> Result<PipelineResult, EngineError>;
}

#[derive(Clone)]
pub struct RecursionHandle {
    pub executor: Arc<dyn SubExecutor>,
    pub remaining_depth: u32,
}

/// Everything a stage may touch while running. One per session, shared by
/// the stages of that session only.
#[derive(Clone)]
pub struct StageContext {
    pub session_id: String,
    pub tenant_id: String,
    pub budget: Arc<BudgetMeter>,
    pub cancel: CancellationToken,
    pub clients: ClientRegistry,
    pub memory: Option<Arc<MemoryBank>>,
    pub clock: Arc<dyn Clock>,
    pub session_start_mono: u64,
    pub seed: Option<u64>,
    pub recursion: Option<RecursionHandle>,
    /// Set by the scheduler when the session is running degraded (budget
    /// abort, cancellation, trimmed plan); synthesis folds it into the
    /// answer.
    pub degradation: Option<String>,
}

impl StageContext {
    pub fn remaining_wall_ms(&self) -> u64 {
        let elapsed = self
            .clock
            .monotonic_ms()
            .saturating_sub(self.session_start_mono);
        self.budget.budget().max_wall_ms.saturating_sub(elapsed)
    }
}

/// What a stage hands back: scratchpad writes plus its usage summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    pub writes: Map<String, Value>,
    pub cost_micros: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, key: &str, value: Value) -> Self {
        self.writes.insert(key.to_string(), value);
        self
    }

    pub fn with_usage(mut self, cost_micros: u64, tokens_in: u64, tokens_out: u64) -> Self {
        self.cost_micros = cost_micros;
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// The uniform stage contract. Concrete stages are values registered by
/// name; the router and scheduler only ever see this trait.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Keys this stage must be able to read. The planner rejects a plan
    /// where any of these lacks an earlier producer.
    fn input_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Keys this stage can use when some earlier stage produces them, but
    /// runs without otherwise.
    fn optional_input_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn output_keys(&self) -> &'static [&'static str];

    fn cacheable(&self) -> bool {
        false
    }

    fn idempotent(&self) -> bool {
        false
    }

    /// Required stages terminate the session on failure; everything else
    /// degrades.
    fn required(&self) -> bool {
        false
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &[]
    }

    async fn run(
        &self,
        ctx: &StageContext,
        view: ScratchpadView<'_>,
        cfg: &Value,
    ) -> Result<StageOutput, StageError>;
}

/// Name-keyed registry of stage values, populated at startup.
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<&'static str, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name(), stage);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.stages.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStage;

    #[async_trait]
    impl Stage for NullStage {
        fn name(&self) -> &'static str {
            "null"
        }

        fn output_keys(&self) -> &'static [&'static str] {
            &["null.out"]
        }

        async fn run(
            &self,
            _ctx: &StageContext,
            _view: ScratchpadView<'_>,
            _cfg: &Value,
        ) -> Result<StageOutput, StageError> {
            Ok(StageOutput::new().write("null.out", Value::Null))
        }
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(NullStage));
        assert!(registry.contains("null"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["null"]);
    }
}
