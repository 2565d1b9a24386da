//! Plan execution. The scheduler walks the plan group by group: singleton
//! groups run sequentially, tagged groups fan out and rejoin on an
//! all-collected barrier. Every stage is wrapped with trace events, a wall
//! deadline, a cache lookup when cacheable, bounded retries when idempotent,
//! and budget bookkeeping. Budget exhaustion or cancellation skips the rest
//! of the plan but still runs the terminal stage best-effort.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use cascade_cache::{cache_key, config_digest, normalize_text, ComputeFailure, ResultCache};
use cascade_clients::RetryPolicy;
use cascade_observability::TraceStore;
use cascade_types::{StageEvent, StagePhase, StagePlan, StageSpec, TerminalState};

use crate::error::{StageError, StageErrorKind};
use crate::scratchpad::Scratchpad;
use crate::stage::{StageContext, StageRegistry, CAP_NEEDS_STUDENT, CAP_NEEDS_TEACHER};
use crate::stages;

pub struct Scheduler {
    registry: Arc<StageRegistry>,
    cache: ResultCache,
    trace: TraceStore,
    retry: RetryPolicy,
    stage_grace_ms: u64,
}

/// Outcome of one plan walk.
pub struct SessionRun {
    pub terminal: TerminalState,
    pub error_summary: Option<String>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<StageRegistry>,
        cache: ResultCache,
        trace: TraceStore,
        retry: RetryPolicy,
        stage_grace_ms: u64,
    ) -> Self {
        Self {
            registry,
            cache,
            trace,
            retry,
            stage_grace_ms,
        }
    }

    pub async fn run(
        &self,
        mut ctx: StageContext,
        plan: &StagePlan,
        pad: &mut Scratchpad,
        trace_enabled: bool,
    ) -> SessionRun {
        let mut failed: Option<String> = None;
        let mut budget_abort: Option<String> = None;
        let mut cancelled = false;

        for group in plan.groups() {
            self.stamp_wall(&ctx);
            if budget_abort.is_none() {
                if let Some(field) = ctx.budget.exhausted() {
                    budget_abort = Some(format!("insufficient budget: {field} exhausted"));
                }
            }
            if !cancelled && ctx.cancel.is_cancelled() {
                cancelled = true;
            }

            let is_terminal_group = group.iter().any(|s| s.stage == stages::SYNTHESIZE);

            // Remaining non-terminal stages are skipped outright: no events,
            // so no orphaned starts. A fatal logic failure skips even the
            // terminal stage; budget and cancel still synthesize best-effort.
            if failed.is_some()
                || ((budget_abort.is_some() || cancelled) && !is_terminal_group)
            {
                continue;
            }

            if is_terminal_group {
                ctx.degradation = if cancelled {
                    Some("cancelled before completion".to_string())
                } else if let Some(reason) = &budget_abort {
                    Some(reason.clone())
                } else {
                    ctx.degradation.clone()
                };
            }

            let mut results: Vec<(&StageSpec, Result<crate::stage::StageOutput, StageError>)> =
                if group.len() == 1 {
                    let spec = group[0];
                    let result = self
                        .run_stage(&ctx, spec, pad, trace_enabled, is_terminal_group)
                        .await;
                    vec![(spec, result)]
                } else {
                    let shared: &Scratchpad = &*pad;
                    let futures_iter = group
                        .iter()
                        .map(|spec| self.run_stage(&ctx, spec, shared, trace_enabled, false));
                    let outcomes = futures::future::join_all(futures_iter).await;
                    group.iter().copied().zip(outcomes).collect()
                };

            // Merge ordering is already plan order; under a deterministic
            // seed it is pinned to stage-name order.
            if ctx.seed.is_some() {
                results.sort_by(|a, b| a.0.stage.cmp(&b.0.stage));
            }

            'merge: for (spec, result) in results {
                match result {
                    Ok(output) => {
                        ctx.budget.record_stage_run();
                        for (key, value) in &output.writes {
                            if let Err(err) = pad.insert(key, value.clone()) {
                                // A write conflict is fatal; nothing else in
                                // this group may alter the outcome.
                                failed = Some(format!("stage `{}`: {}", spec.stage, err.message));
                                self.emit(
                                    trace_enabled,
                                    self.event(&ctx, &spec.stage, StagePhase::Error)
                                        .with_error(err.kind.as_str(), &err.message),
                                )
                                .await;
                                break 'merge;
                            }
                        }
                    }
                    Err(err) => match err.kind {
                        StageErrorKind::Budget => {
                            // A per-call refusal (role call cap, cost
                            // estimate) degrades and lets fallbacks run; the
                            // session aborts only when the shared budget is
                            // actually spent.
                            let session_spent = ctx.budget.exhausted().is_some()
                                || ctx.remaining_wall_ms() == 0;
                            if session_spent {
                                budget_abort
                                    .get_or_insert(format!("insufficient budget: {}", err.message));
                            } else {
                                tracing::debug!(
                                    target: "cascade.engine",
                                    stage = %spec.stage,
                                    "stage budget refusal degraded: {}",
                                    err.message
                                );
                            }
                        }
                        StageErrorKind::Cancelled => {
                            cancelled = true;
                        }
                        _ => {
                            let required = self
                                .registry
                                .get(&spec.stage)
                                .map(|s| s.required())
                                .unwrap_or(false);
                            if required {
                                failed =
                                    Some(format!("stage `{}` failed: {}", spec.stage, err.message));
                            } else {
                                tracing::debug!(
                                    target: "cascade.engine",
                                    stage = %spec.stage,
                                    kind = err.kind.as_str(),
                                    "optional stage degraded: {}",
                                    err.message
                                );
                            }
                        }
                    },
                }
            }
        }

        self.stamp_wall(&ctx);
        if budget_abort.is_none() {
            if let Some(field) = ctx.budget.exhausted() {
                budget_abort = Some(format!("insufficient budget: {field} exhausted"));
            }
        }

        let (terminal, error_summary) = if let Some(message) = failed {
            (TerminalState::Failed, Some(message))
        } else if cancelled {
            (TerminalState::Cancelled, Some("session cancelled".to_string()))
        } else if let Some(message) = budget_abort {
            (TerminalState::AbortedBudget, Some(message))
        } else {
            (TerminalState::Ok, None)
        };
        SessionRun {
            terminal,
            error_summary,
        }
    }

    fn stamp_wall(&self, ctx: &StageContext) {
        let elapsed = ctx
            .clock
            .monotonic_ms()
            .saturating_sub(ctx.session_start_mono);
        ctx.budget.set_wall_ms(elapsed);
    }

    /// One stage invocation: start event, optional cache wrap, bounded
    /// attempts, terminal end/error event.
    async fn run_stage(
        &self,
        ctx: &StageContext,
        spec: &StageSpec,
        pad: &Scratchpad,
        trace_enabled: bool,
        terminal: bool,
    ) -> Result<crate::stage::StageOutput, StageError> {
        let Some(stage) = self.registry.get(&spec.stage) else {
            let err = StageError::internal(format!("stage `{}` is not registered", spec.stage));
            self.emit(
                trace_enabled,
                self.event(ctx, &spec.stage, StagePhase::Error)
                    .with_error(err.kind.as_str(), &err.message),
            )
            .await;
            return Err(err);
        };

        let started_at = ctx.clock.now();
        self.emit(trace_enabled, self.event(ctx, &spec.stage, StagePhase::Start))
            .await;

        let outcome = if spec.cacheable {
            let inputs = resolved_inputs(spec, pad, &ctx.tenant_id);
            let identity = self.client_identity(ctx, stage.capabilities()).await;
            let key = cache_key(
                &spec.stage,
                &inputs,
                &config_digest(&spec.config),
                &identity,
            );
            let compute = async {
                self.execute_attempts(ctx, spec, stage.clone(), pad, trace_enabled, terminal)
                    .await
                    .and_then(|output| {
                        serde_json::to_value(&output)
                            .map_err(|err| StageError::internal(err.to_string()))
                    })
                    .map_err(|err| ComputeFailure::new(err.kind.as_str(), err.message))
            };
            // Cap the wait so a single-flight join on another session's
            // compute cannot outlive this session's wall budget.
            let wait_cap = ctx
                .remaining_wall_ms()
                .max(self.stage_grace_ms)
                .max(50);
            let lookup = tokio::time::timeout(
                Duration::from_millis(wait_cap),
                self.cache
                    .get_or_compute(&key, self.cache.default_ttl_ms(), compute),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ComputeFailure::new(
                    StageErrorKind::Budget.as_str(),
                    "stage wall deadline exceeded while awaiting shared compute",
                ))
            });
            match lookup {
                Ok(lookup) => {
                    let mut output: crate::stage::StageOutput =
                        serde_json::from_value(lookup.value).unwrap_or_default();
                    if lookup.cache_hit {
                        ctx.budget.record_cache_hit();
                        output.cost_micros = 0;
                        output.tokens_in = 0;
                        output.tokens_out = 0;
                    }
                    Ok((output, lookup.cache_hit))
                }
                Err(failure) => Err(StageError::new(
                    StageErrorKind::parse(&failure.kind),
                    failure.message,
                )),
            }
        } else {
            self.execute_attempts(ctx, spec, stage, pad, trace_enabled, terminal)
                .await
                .map(|output| (output, false))
        };

        match outcome {
            Ok((output, cache_hit)) => {
                let mut event = self
                    .event(ctx, &spec.stage, StagePhase::End)
                    .with_window(started_at, ctx.clock.now())
                    .with_usage(output.cost_micros, output.tokens_in, output.tokens_out);
                event.cache_hit = cache_hit;
                event.notes = output.notes.clone();
                self.emit(trace_enabled, event).await;
                Ok(output)
            }
            Err(err) => {
                let event = self
                    .event(ctx, &spec.stage, StagePhase::Error)
                    .with_window(started_at, ctx.clock.now())
                    .with_error(err.kind.as_str(), &err.message);
                self.emit(trace_enabled, event).await;
                Err(err)
            }
        }
    }

    /// The attempt loop: wall deadline per attempt, cooperative
    /// cancellation with a grace window, retries for idempotent stages on
    /// retryable kinds only.
    async fn execute_attempts(
        &self,
        ctx: &StageContext,
        spec: &StageSpec,
        stage: Arc<dyn crate::stage::Stage>,
        pad: &Scratchpad,
        trace_enabled: bool,
        terminal: bool,
    ) -> Result<crate::stage::StageOutput, StageError> {
        let mut attempt: u32 = 1;
        loop {
            if !terminal && ctx.cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }

            let attempt_started = ctx.clock.now();
            let remaining = ctx.remaining_wall_ms();
            let timeout_ms = if terminal {
                // The terminal stage composes best-effort even after the
                // wall is spent; it gets the grace window as a floor.
                remaining.max(self.stage_grace_ms).max(50)
            } else {
                remaining
            };
            if timeout_ms == 0 {
                return Err(StageError::budget("no wall budget remaining"));
            }

            let view = pad.view(&spec.input_keys);
            let run = stage.run(ctx, view, &spec.config);
            let timed = tokio::time::timeout(Duration::from_millis(timeout_ms), run);

            let outcome = if terminal {
                timed
                    .await
                    .unwrap_or_else(|_| Err(StageError::budget("stage wall deadline exceeded")))
            } else {
                let cancel = ctx.cancel.clone();
                let grace = self.stage_grace_ms;
                tokio::select! {
                    result = timed => result
                        .unwrap_or_else(|_| Err(StageError::budget("stage wall deadline exceeded"))),
                    _ = async move {
                        cancel.cancelled().await;
                        tokio::time::sleep(Duration::from_millis(grace)).await;
                    } => Err(StageError::cancelled()),
                }
            };

            match outcome {
                Ok(output) => return Ok(output),
                Err(err)
                    if err.kind.is_retryable()
                        && spec.idempotent
                        && self.retry.retries_left(attempt)
                        && !ctx.cancel.is_cancelled() =>
                {
                    let event = self
                        .event(ctx, &spec.stage, StagePhase::Retry)
                        .with_window(attempt_started, ctx.clock.now())
                        .with_error(err.kind.as_str(), &err.message);
                    self.emit(trace_enabled, event).await;

                    let backoff = self.retry.backoff_ms(attempt);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn client_identity(&self, ctx: &StageContext, capabilities: &[&str]) -> String {
        let name = if capabilities.contains(&CAP_NEEDS_TEACHER) {
            Some("teacher")
        } else if capabilities.contains(&CAP_NEEDS_STUDENT) {
            Some("student")
        } else {
            None
        };
        match name {
            Some(name) => ctx
                .clients
                .client_identity(name)
                .await
                .unwrap_or_else(|| "unconfigured".to_string()),
            None => "local".to_string(),
        }
    }

    fn event(&self, ctx: &StageContext, stage: &str, phase: StagePhase) -> StageEvent {
        StageEvent {
            seq: 0,
            session_id: ctx.session_id.clone(),
            stage: stage.to_string(),
            phase,
            started_at: ctx.clock.now(),
            ended_at: None,
            cost_micros: 0,
            tokens_in: 0,
            tokens_out: 0,
            cache_hit: false,
            error_kind: None,
            notes: None,
        }
    }

    async fn emit(&self, enabled: bool, event: StageEvent) {
        if enabled {
            self.trace.append_event(event).await;
        }
    }
}

/// Snapshot of a cacheable stage's resolved inputs, canonicalized: string
/// leaves normalized, tenant folded in so sessions never share across
/// tenants.
fn resolved_inputs(spec: &StageSpec, pad: &Scratchpad, tenant_id: &str) -> Value {
    let mut inputs = Map::new();
    inputs.insert("tenant".to_string(), json!(tenant_id));
    for key in &spec.input_keys {
        let value = match pad.get(key) {
            Some(Value::String(s)) => Value::String(normalize_text(s)),
            Some(other) => other.clone(),
            None => Value::Null,
        };
        inputs.insert(key.clone(), value);
    }
    Value::Object(inputs)
}

trait EventExt {
    fn with_window(
        self,
        started: chrono::DateTime<chrono::Utc>,
        ended: chrono::DateTime<chrono::Utc>,
    ) -> Self;
    fn with_usage(self, cost_micros: u64, tokens_in: u64, tokens_out: u64) -> Self;
    fn with_error(self, kind: &str, message: &str) -> Self;
}

impl EventExt for StageEvent {
    fn with_window(
        mut self,
        started: chrono::DateTime<chrono::Utc>,
        ended: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        self.started_at = started;
        self.ended_at = Some(ended);
        self
    }

    fn with_usage(mut self, cost_micros: u64, tokens_in: u64, tokens_out: u64) -> Self {
        self.cost_micros = cost_micros;
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    fn with_error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.notes = Some(message.to_string());
        self
    }
}
