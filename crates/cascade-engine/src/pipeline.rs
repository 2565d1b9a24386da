//! The facade. `execute` is the only entrypoint external surfaces bind to:
//! it validates input, estimates difficulty, builds the plan, runs the
//! scheduler and always hands back a result with a terminal state. Runtime
//! failures never cross this boundary as errors; input and planning
//! problems surface synchronously, before a session exists.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cascade_cache::{CacheConfig, ResultCache};
use cascade_clients::{
    CircuitBreakerConfig, ClientRegistry, EchoClient, RateLimitConfig, RetryPolicy,
};
use cascade_memory::MemoryBank;
use cascade_observability::{TraceStore, TraceStoreConfig};
use cascade_types::{
    Budget, BudgetMeter, Clock, IdGen, ModelRole, PipelineResult, Query, Session, SystemClock,
};

use crate::config::EngineConfig;
use crate::difficulty::DifficultyEstimator;
use crate::error::EngineError;
use crate::keys;
use crate::router::{PlanRequest, Router};
use crate::scheduler::Scheduler;
use crate::scratchpad::Scratchpad;
use crate::stage::{RecursionHandle, StageContext, StageRegistry, SubExecutor};
use crate::stages;

/// Per-call options. Everything is optional; defaults come from the engine
/// configuration (and the tenant's overrides).
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub domain_hint: Option<String>,
    pub budget: Option<Budget>,
    /// Allow-list: when set, only these stages (plus the terminal stage)
    /// may appear in the plan.
    pub enabled_stages: Option<Vec<String>>,
    pub disabled_stages: Vec<String>,
    pub recursion_depth_max: Option<u32>,
    pub trace: bool,
    pub deterministic_seed: Option<u64>,
    pub tenant_id: Option<String>,
    pub needs_refinement: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            domain_hint: None,
            budget: None,
            enabled_stages: None,
            disabled_stages: Vec::new(),
            recursion_depth_max: None,
            trace: true,
            deterministic_seed: None,
            tenant_id: None,
            needs_refinement: false,
        }
    }
}

pub struct PipelineBuilder {
    config: EngineConfig,
    clients: Option<ClientRegistry>,
    memory: Option<Arc<MemoryBank>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<IdGen>,
    trace_config: TraceStoreConfig,
}

impl PipelineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clients: None,
            memory: None,
            clock: None,
            ids: None,
            trace_config: TraceStoreConfig::default(),
        }
    }

    pub fn with_clients(mut self, clients: ClientRegistry) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryBank>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_ids(mut self, ids: IdGen) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_trace_config(mut self, trace_config: TraceStoreConfig) -> Self {
        self.trace_config = trace_config;
        self
    }

    pub async fn build(self) -> Result<Arc<Pipeline>, EngineError> {
        let clients = match self.clients {
            Some(clients) => clients,
            None => {
                // Runnable out of the box: echo clients for both roles.
                let registry = ClientRegistry::new();
                registry
                    .register(
                        "teacher",
                        ModelRole::Teacher,
                        Arc::new(EchoClient::new("echo-teacher")),
                        RateLimitConfig::default(),
                        CircuitBreakerConfig::default(),
                    )
                    .await;
                registry
                    .register(
                        "student",
                        ModelRole::Student,
                        Arc::new(EchoClient::new("echo-student")),
                        RateLimitConfig::default(),
                        CircuitBreakerConfig::default(),
                    )
                    .await;
                registry
            }
        };

        let cache = ResultCache::new(CacheConfig {
            max_entries: self.config.cache.max_entries,
            default_ttl_ms: self.config.cache.default_ttl_ms,
        });
        let trace = TraceStore::new(self.trace_config);
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let ids = self.ids.unwrap_or_else(IdGen::random);
        let registry = Arc::new(stages::builtin_registry());

        let retry = RetryPolicy {
            max_attempts: self.config.scheduler.retry.max_attempts,
            base_backoff_ms: self.config.scheduler.retry.base_backoff_ms,
            jitter_ms: self.config.scheduler.retry.jitter_ms,
        };
        let scheduler = Scheduler::new(
            registry.clone(),
            cache.clone(),
            trace.clone(),
            retry,
            self.config.scheduler.stage_grace_ms,
        );

        let pipeline = Arc::new(Pipeline {
            config: self.config,
            registry,
            scheduler,
            clients,
            memory: self.memory,
            cache,
            trace,
            clock,
            ids,
            self_ref: OnceLock::new(),
        });
        let _ = pipeline.self_ref.set(Arc::downgrade(&pipeline));
        Ok(pipeline)
    }
}

pub struct Pipeline {
    config: EngineConfig,
    registry: Arc<StageRegistry>,
    scheduler: Scheduler,
    clients: ClientRegistry,
    memory: Option<Arc<MemoryBank>>,
    cache: ResultCache,
    trace: TraceStore,
    clock: Arc<dyn Clock>,
    ids: IdGen,
    self_ref: OnceLock<Weak<Pipeline>>,
}

impl Pipeline {
    pub fn builder(config: EngineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub async fn execute(
        &self,
        text: &str,
        options: ExecuteOptions,
    ) -> Result<PipelineResult, EngineError> {
        self.execute_with_cancel(text, options, CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        text: &str,
        options: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineResult, EngineError> {
        let tenant_id = options
            .tenant_id
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let config = self.config.for_tenant(&tenant_id)?;

        self.validate_stage_lists(&options)?;

        let budget = options
            .budget
            .clone()
            .unwrap_or_else(|| config.budget_defaults.clone());
        let query = Query {
            text: text.to_string(),
            domain_hint: options.domain_hint.clone(),
            tenant_id: tenant_id.clone(),
            budget: budget.clone(),
            trace: options.trace,
        };
        query.validate().map_err(EngineError::Input)?;

        let depth = options
            .recursion_depth_max
            .unwrap_or_else(|| config.recursion.effective_depth())
            .min(3);

        let estimator = DifficultyEstimator::new(config.difficulty.clone());
        let difficulty = estimator.estimate(text, query.domain_hint.as_deref(), 0);

        let router = Router::new(self.registry.clone());
        let (plan, trimmed) = router.build_plan(&PlanRequest {
            difficulty: &difficulty,
            domain_hint: query.domain_hint.as_deref(),
            budget: &budget,
            options: &options,
            config: &config,
            recursion_remaining: depth,
        })?;

        let session_id = self.ids.next(self.clock.as_ref());
        tracing::info!(
            target: "cascade.engine",
            session_id = %session_id,
            tenant = %tenant_id,
            difficulty = difficulty.score,
            stages = plan.len(),
            "session started"
        );

        let session = Session::new(session_id.clone(), query, plan.clone(), self.clock.now());
        self.trace.begin(session).await;

        let meter = Arc::new(BudgetMeter::new(budget));
        let mut pad = Scratchpad::new();
        pad.insert(keys::QUERY_TEXT, json!(text))
            .map_err(|err| EngineError::Internal(err.message.clone()))?;
        if let Some(hint) = &options.domain_hint {
            pad.insert(keys::QUERY_DOMAIN_HINT, json!(hint))
                .map_err(|err| EngineError::Internal(err.message.clone()))?;
        }

        let recursion = if depth > 0 && config.features.recurse {
            self.self_ref.get().and_then(Weak::upgrade).map(|pipeline| {
                let executor: Arc<dyn SubExecutor> = pipeline;
                RecursionHandle {
                    executor,
                    remaining_depth: depth,
                }
            })
        } else {
            None
        };

        let ctx = StageContext {
            session_id: session_id.clone(),
            tenant_id,
            budget: meter.clone(),
            cancel,
            clients: self.clients.clone(),
            memory: if config.features.memory {
                self.memory.clone()
            } else {
                None
            },
            clock: self.clock.clone(),
            session_start_mono: self.clock.monotonic_ms(),
            seed: options.deterministic_seed,
            recursion,
            degradation: trimmed
                .then(|| "insufficient budget: stage budget trimmed the plan".to_string()),
        };

        let run = self.scheduler.run(ctx, &plan, &mut pad, options.trace).await;

        let totals = meter.totals();
        let answer = pad
            .get(keys::FINAL_ANSWER)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let provenance: Vec<String> = pad
            .get(keys::FINAL_PROVENANCE)
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let result = PipelineResult {
            session_id: session_id.clone(),
            answer,
            provenance,
            terminal_state: run.terminal,
            totals: totals.clone(),
            error_summary: run.error_summary,
        };

        self.trace
            .close(
                &session_id,
                pad.snapshot(),
                totals,
                Some(result.clone()),
                run.terminal,
                self.clock.now(),
            )
            .await;

        tracing::info!(
            target: "cascade.engine",
            session_id = %session_id,
            terminal = %run.terminal,
            cost_micros = result.totals.cost_micros,
            "session closed"
        );
        Ok(result)
    }

    /// Full session trace for observability surfaces.
    pub async fn get_trace(&self, session_id: &str) -> Option<Session> {
        self.trace.get(session_id).await
    }

    pub async fn shutdown(&self) {
        self.cache.clear().await;
        tracing::info!(target: "cascade.engine", "pipeline shut down");
    }

    fn validate_stage_lists(&self, options: &ExecuteOptions) -> Result<(), EngineError> {
        if let Some(enabled) = &options.enabled_stages {
            for name in enabled {
                if !self.registry.contains(name) {
                    return Err(EngineError::Input(format!(
                        "unknown stage `{name}` in enabled_stages"
                    )));
                }
            }
        }
        for name in &options.disabled_stages {
            if !self.registry.contains(name) {
                return Err(EngineError::Input(format!(
                    "unknown stage `{name}` in disabled_stages"
                )));
            }
            if name == stages::SYNTHESIZE {
                return Err(EngineError::Input(
                    "the terminal synthesize stage cannot be disabled".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubExecutor for Pipeline {
    async fn execute_sub(
        &self,
        text: String,
        options: ExecuteOptions,
    ) -> Result<PipelineResult, EngineError> {
        self.execute(&text, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cascade_clients::testing::ScriptedClient;
    use cascade_clients::{ClientError, GenerateOptions, Generation, ModelClient};
    use cascade_memory::{HashEmbedder, MemoryBank, MemoryBankConfig, NoteStore};
    use cascade_types::{StagePhase, TerminalState, MAX_QUERY_BYTES};

    async fn registry_with(
        teacher: Arc<dyn ModelClient>,
        student: Arc<dyn ModelClient>,
    ) -> ClientRegistry {
        let registry = ClientRegistry::new();
        registry
            .register(
                "teacher",
                ModelRole::Teacher,
                teacher,
                RateLimitConfig::default(),
                CircuitBreakerConfig::default(),
            )
            .await;
        registry
            .register(
                "student",
                ModelRole::Student,
                student,
                RateLimitConfig::default(),
                CircuitBreakerConfig::default(),
            )
            .await;
        registry
    }

    fn memory_bank() -> Arc<MemoryBank> {
        Arc::new(
            MemoryBank::new(
                NoteStore::open_in_memory().unwrap(),
                Arc::new(HashEmbedder::new()),
                MemoryBankConfig::default(),
            )
            .unwrap(),
        )
    }

    fn assert_paired_events(session: &Session) {
        for event in &session.events {
            if event.phase == StagePhase::Start {
                let terminal = session.events.iter().any(|later| {
                    later.seq > event.seq
                        && later.stage == event.stage
                        && matches!(later.phase, StagePhase::End | StagePhase::Error)
                });
                assert!(
                    terminal,
                    "start event for `{}` has no matching end/error",
                    event.stage
                );
            }
        }
    }

    #[tokio::test]
    async fn trivial_query_runs_minimal_plan_at_zero_cost() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .build()
            .await
            .unwrap();
        let result = pipeline
            .execute(
                "2+2=?",
                ExecuteOptions {
                    budget: Some(Budget {
                        max_wall_ms: 2000,
                        max_cost_micros: 0,
                        max_teacher_calls: 0,
                        max_student_calls: 0,
                        max_stages: 12,
                    }),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.terminal_state, TerminalState::Ok);
        assert!(!result.answer.is_empty());
        assert_eq!(result.totals.cost_micros, 0);

        let session = pipeline.get_trace(&result.session_id).await.unwrap();
        assert_eq!(
            session.plan.stage_names(),
            vec!["domain_detect", "retrieve", "synthesize"]
        );
        let synthesize_ends = session
            .events
            .iter()
            .filter(|e| e.stage == "synthesize" && e.phase == StagePhase::End)
            .count();
        assert_eq!(synthesize_ends, 1);
        assert_paired_events(&session);
    }

    #[tokio::test]
    async fn retryable_teacher_failure_recovers_with_one_retry() {
        let teacher = Arc::new(ScriptedClient::new("teacher-model", 0));
        teacher.push_err(ClientError::Retryable("upstream 502".into()));
        teacher.push_ok("RAFT reaches consensus through an elected leader [n1].", 1000);
        let student = Arc::new(cascade_clients::EchoClient::new("echo-student"));

        let pipeline = Pipeline::builder(EngineConfig::default())
            .with_clients(registry_with(teacher.clone(), student).await)
            .build()
            .await
            .unwrap();

        let result = pipeline
            .execute(
                "Explain RAFT consensus, cite sources",
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.terminal_state, TerminalState::Ok);
        assert!(result.provenance.contains(&"teacher_call".to_string()));

        let session = pipeline.get_trace(&result.session_id).await.unwrap();
        assert!(session.plan.contains("teacher_call"));
        assert!(session.plan.contains("decompose"));

        let teacher_events: Vec<_> = session
            .events
            .iter()
            .filter(|e| e.stage == "teacher_call")
            .collect();
        let retries = teacher_events
            .iter()
            .filter(|e| e.phase == StagePhase::Retry)
            .count();
        let ends = teacher_events
            .iter()
            .filter(|e| e.phase == StagePhase::End)
            .count();
        assert_eq!(retries, 1);
        assert_eq!(ends, 1);
        assert_eq!(teacher.calls(), 2);
        assert_paired_events(&session);
    }

    #[tokio::test]
    async fn open_teacher_circuit_falls_back_to_student() {
        let teacher = Arc::new(cascade_clients::EchoClient::new("echo-teacher"));
        let student = Arc::new(ScriptedClient::new("student-model", 0));
        student.push_ok("The student's grounded answer about raft consensus.", 10);

        let pipeline = Pipeline::builder(EngineConfig::default())
            .with_clients(registry_with(teacher, student).await)
            .build()
            .await
            .unwrap();
        pipeline.clients().force_circuit_open("teacher").await;

        let result = pipeline
            .execute(
                "Explain RAFT consensus, cite sources",
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.terminal_state, TerminalState::Ok);
        assert!(result.provenance.contains(&"student_call".to_string()));
        assert!(!result.provenance.contains(&"teacher_call".to_string()));

        let session = pipeline.get_trace(&result.session_id).await.unwrap();
        let teacher_error = session
            .events
            .iter()
            .find(|e| e.stage == "teacher_call" && e.phase == StagePhase::Error)
            .expect("teacher error event");
        assert_eq!(teacher_error.error_kind.as_deref(), Some("circuit_open"));
        assert_paired_events(&session);
    }

    #[tokio::test]
    async fn concurrent_identical_retrieves_share_one_compute() {
        let bank = memory_bank();
        bank.upsert("default", "general", "raft elects a leader per term", true)
            .await
            .unwrap();

        let pipeline = Pipeline::builder(EngineConfig::default())
            .with_memory(bank)
            .build()
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            pipeline.execute("what is stored about raft", ExecuteOptions::default()),
            pipeline.execute("what is stored about raft", ExecuteOptions::default()),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        let mut hits = 0;
        for result in [&a, &b] {
            let session = pipeline.get_trace(&result.session_id).await.unwrap();
            hits += session
                .events
                .iter()
                .filter(|e| e.stage == "retrieve" && e.phase == StagePhase::End && e.cache_hit)
                .count();
        }
        assert_eq!(hits, 1, "exactly one of the two retrieves is a shared hit");
    }

    struct SlowClient;

    #[async_trait]
    impl ModelClient for SlowClient {
        fn id(&self) -> &str {
            "slow-model"
        }

        fn estimate_cost_micros(&self, _prompt: &str, _opts: &GenerateOptions) -> u64 {
            0
        }

        async fn generate(
            &self,
            _prompt: &str,
            _opts: &GenerateOptions,
        ) -> Result<Generation, ClientError> {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Err(ClientError::Transport("never reached".into()))
        }
    }

    #[tokio::test]
    async fn wall_exhaustion_aborts_but_still_synthesizes() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .with_clients(
                registry_with(
                    Arc::new(SlowClient),
                    Arc::new(cascade_clients::EchoClient::new("echo-student")),
                )
                .await,
            )
            .build()
            .await
            .unwrap();

        let result = pipeline
            .execute(
                "Explain RAFT consensus, cite sources",
                ExecuteOptions {
                    budget: Some(Budget {
                        max_wall_ms: 120,
                        ..Budget::default()
                    }),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.terminal_state, TerminalState::AbortedBudget);
        assert!(!result.answer.is_empty());

        let session = pipeline.get_trace(&result.session_id).await.unwrap();
        assert!(session
            .events
            .iter()
            .any(|e| e.stage == "synthesize" && e.phase == StagePhase::End));
        assert_paired_events(&session);
    }

    #[tokio::test]
    async fn pre_cancelled_session_terminates_cancelled_with_answer() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .build()
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline
            .execute_with_cancel("2+2=?", ExecuteOptions::default(), cancel)
            .await
            .unwrap();
        assert_eq!(result.terminal_state, TerminalState::Cancelled);
        assert!(result.answer.contains("cancelled"));
    }

    #[tokio::test]
    async fn empty_query_is_an_input_error() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .build()
            .await
            .unwrap();
        let err = pipeline
            .execute("   ", ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[tokio::test]
    async fn query_at_exact_size_limit_is_accepted() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .build()
            .await
            .unwrap();
        let text = "a ".repeat(MAX_QUERY_BYTES / 2);
        assert_eq!(text.len(), MAX_QUERY_BYTES);
        let result = pipeline
            .execute(&text, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.terminal_state, TerminalState::Ok);
    }

    #[tokio::test]
    async fn zero_stage_budget_degrades_citing_insufficient_budget() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .build()
            .await
            .unwrap();
        let result = pipeline
            .execute(
                "Explain RAFT consensus, cite sources",
                ExecuteOptions {
                    budget: Some(Budget {
                        max_stages: 0,
                        ..Budget::default()
                    }),
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.terminal_state, TerminalState::Ok);
        assert!(result.answer.contains("insufficient budget"));

        let session = pipeline.get_trace(&result.session_id).await.unwrap();
        assert_eq!(session.plan.stage_names(), vec!["synthesize"]);
    }

    #[tokio::test]
    async fn unknown_stage_in_deny_list_is_an_input_error() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .build()
            .await
            .unwrap();
        let err = pipeline
            .execute(
                "2+2=?",
                ExecuteOptions {
                    disabled_stages: vec!["nonsense_stage".to_string()],
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[tokio::test]
    async fn identical_seeded_runs_agree_on_provenance() {
        let options = ExecuteOptions {
            deterministic_seed: Some(7),
            ..ExecuteOptions::default()
        };

        let mut provenances = Vec::new();
        for _ in 0..2 {
            let pipeline = Pipeline::builder(EngineConfig::default())
                .build()
                .await
                .unwrap();
            let result = pipeline
                .execute("Explain RAFT consensus, cite sources", options.clone())
                .await
                .unwrap();
            let session = pipeline.get_trace(&result.session_id).await.unwrap();
            provenances.push((session.plan.stage_names(), result.provenance));
        }
        assert_eq!(provenances[0], provenances[1]);
    }

    #[tokio::test]
    async fn circuit_open_without_student_fallback_still_returns_ok() {
        let teacher = Arc::new(cascade_clients::EchoClient::new("echo-teacher"));
        let student = Arc::new(cascade_clients::EchoClient::new("echo-student"));
        let pipeline = Pipeline::builder(EngineConfig::default())
            .with_clients(registry_with(teacher, student).await)
            .build()
            .await
            .unwrap();
        pipeline.clients().force_circuit_open("teacher").await;

        let result = pipeline
            .execute(
                "Explain RAFT consensus, cite sources",
                ExecuteOptions {
                    disabled_stages: vec!["student_call".to_string(), "query_expand".to_string()],
                    ..ExecuteOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.terminal_state, TerminalState::Ok);
        assert!(!result.answer.is_empty());

        let session = pipeline.get_trace(&result.session_id).await.unwrap();
        let synthesize_end = session
            .events
            .iter()
            .find(|e| e.stage == "synthesize" && e.phase == StagePhase::End)
            .expect("synthesize end");
        assert!(synthesize_end.notes.as_deref().unwrap_or_default().contains("degraded"));
    }

    #[tokio::test]
    async fn trace_lookup_returns_closed_session_with_totals() {
        let pipeline = Pipeline::builder(EngineConfig::default())
            .build()
            .await
            .unwrap();
        let result = pipeline
            .execute("2+2=?", ExecuteOptions::default())
            .await
            .unwrap();
        let session = pipeline.get_trace(&result.session_id).await.unwrap();
        assert_eq!(session.terminal_state, Some(TerminalState::Ok));
        assert!(session.ended_at.is_some());
        assert!(!session.events.is_empty());
        assert!(session.scratchpad.contains_key("final.answer"));
    }
}
