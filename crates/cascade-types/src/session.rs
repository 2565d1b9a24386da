use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::budget::Totals;
use crate::plan::StagePlan;
use crate::query::Query;

/// Lifecycle phase of one stage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Start,
    End,
    Error,
    Retry,
}

impl StagePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StagePhase::Start => "start",
            StagePhase::End => "end",
            StagePhase::Error => "error",
            StagePhase::Retry => "retry",
        }
    }
}

/// One telemetry record in a session's trace. Ordered per session by `seq`,
/// assigned at emission; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub seq: u64,
    pub session_id: String,
    pub stage: String,
    pub phase: StagePhase,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cost_micros: u64,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Ok,
    Failed,
    AbortedBudget,
    Cancelled,
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalState::Ok => write!(f, "ok"),
            TerminalState::Failed => write!(f, "failed"),
            TerminalState::AbortedBudget => write!(f, "aborted_budget"),
            TerminalState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What the facade hands back: answer, provenance, totals, terminal state
/// and the session id for trace lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub session_id: String,
    pub answer: String,
    /// Stage names that contributed to the final answer, in priority order.
    #[serde(default)]
    pub provenance: Vec<String>,
    pub terminal_state: TerminalState,
    pub totals: Totals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

/// Full record of one pipeline run: query, plan, ordered events, final
/// scratchpad snapshot and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub query: Query,
    pub plan: StagePlan,
    #[serde(default)]
    pub events: Vec<StageEvent>,
    #[serde(default)]
    pub scratchpad: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<PipelineResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_state: Option<TerminalState>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub totals: Totals,
}

impl Session {
    pub fn new(id: String, query: Query, plan: StagePlan, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            query,
            plan,
            events: Vec::new(),
            scratchpad: Map::new(),
            final_result: None,
            terminal_state: None,
            started_at,
            ended_at: None,
            totals: Totals::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_state_serializes_snake_case() {
        let json = serde_json::to_string(&TerminalState::AbortedBudget).unwrap();
        assert_eq!(json, "\"aborted_budget\"");
    }

    #[test]
    fn stage_event_roundtrips() {
        let event = StageEvent {
            seq: 3,
            session_id: "s1".to_string(),
            stage: "retrieve".to_string(),
            phase: StagePhase::End,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            cost_micros: 0,
            tokens_in: 0,
            tokens_out: 0,
            cache_hit: true,
            error_kind: None,
            notes: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["phase"], "end");
        assert_eq!(json["cache_hit"], true);
        let back: StageEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.seq, 3);
    }
}
