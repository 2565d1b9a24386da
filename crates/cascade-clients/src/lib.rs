use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use cascade_types::{BudgetMeter, ModelRole};

pub mod circuit;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod testing;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::ClientError;
pub use rate_limit::{RateLimitConfig, TokenBucket};
pub use retry::RetryPolicy;

/// Per-call generation options forwarded to the concrete client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    pub timeout_ms: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            stop: None,
            timeout_ms: 30_000,
        }
    }
}

/// What one model call produced, including its accounting footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_micros: u64,
    pub latency_ms: u64,
    pub provider_id: String,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn id(&self) -> &str;

    /// Upper-bound cost estimate for the synchronous budget refusal. A call
    /// whose estimate does not fit the remaining budget never goes out.
    fn estimate_cost_micros(&self, prompt: &str, opts: &GenerateOptions) -> u64;

    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<Generation, ClientError>;
}

struct ClientEntry {
    client: Arc<dyn ModelClient>,
    role: ModelRole,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
}

/// Named clients (any name; each accounted as the teacher or student
/// role) with shared per-client rate
/// limiting, circuit breaking and cost accounting. One registry serves all
/// sessions in the process.
///
/// The registry classifies and returns failures; retrying is the caller's
/// policy. The engine applies one retry envelope at the stage boundary so
/// every attempt is visible in the session trace.
#[derive(Clone)]
pub struct ClientRegistry {
    entries: Arc<RwLock<HashMap<String, Arc<ClientEntry>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(
        &self,
        name: &str,
        role: ModelRole,
        client: Arc<dyn ModelClient>,
        rate: RateLimitConfig,
        breaker: CircuitBreakerConfig,
    ) {
        let entry = ClientEntry {
            client,
            role,
            limiter: TokenBucket::new(rate),
            breaker: CircuitBreaker::new(breaker),
        };
        self.entries
            .write()
            .await
            .insert(name.to_string(), Arc::new(entry));
    }

    pub async fn has(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn client_identity(&self, name: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(name).map(|e| e.client.id().to_string())
    }

    /// Force a named client's circuit open (fault injection / tests).
    pub async fn force_circuit_open(&self, name: &str) {
        if let Some(entry) = self.entries.read().await.get(name) {
            entry.breaker.force_open().await;
        }
    }

    pub async fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        let entries = self.entries.read().await;
        match entries.get(name) {
            Some(entry) => Some(entry.breaker.state().await),
            None => None,
        }
    }

    /// One guarded model call: circuit admission, budget reservation,
    /// synchronous cost refusal, rate limit, dispatch, then accounting.
    pub async fn generate(
        &self,
        name: &str,
        prompt: &str,
        opts: &GenerateOptions,
        budget: &BudgetMeter,
    ) -> Result<Generation, ClientError> {
        let entry = {
            let entries = self.entries.read().await;
            entries
                .get(name)
                .cloned()
                .ok_or_else(|| ClientError::Invalid(format!("unknown model client `{name}`")))?
        };

        if !entry.breaker.admit().await {
            return Err(ClientError::CircuitOpen(name.to_string()));
        }

        budget
            .try_reserve_call(entry.role)
            .map_err(|field| ClientError::BudgetExceeded(format!("{field} spent")))?;

        let estimate = entry.client.estimate_cost_micros(prompt, opts);
        if let Err(field) = budget.check_cost(estimate) {
            budget.release_call(entry.role);
            return Err(ClientError::BudgetExceeded(format!(
                "{field}: estimated call cost {estimate} over remaining budget"
            )));
        }

        if !entry.limiter.try_acquire().await {
            budget.release_call(entry.role);
            return Err(ClientError::RateLimited(format!(
                "client `{name}` token bucket empty"
            )));
        }

        let started = Instant::now();
        match entry.client.generate(prompt, opts).await {
            Ok(mut generation) => {
                if generation.latency_ms == 0 {
                    generation.latency_ms = started.elapsed().as_millis() as u64;
                }
                entry.breaker.record_success().await;
                budget.record_cost(generation.cost_micros);
                budget.record_tokens(generation.tokens_in, generation.tokens_out);
                tracing::debug!(
                    target: "cascade.clients",
                    client = name,
                    provider = %generation.provider_id,
                    cost_micros = generation.cost_micros,
                    latency_ms = generation.latency_ms,
                    "model call succeeded"
                );
                Ok(generation)
            }
            Err(err) => {
                if err.counts_against_circuit() {
                    entry.breaker.record_failure().await;
                }
                budget.release_call(entry.role);
                tracing::warn!(
                    target: "cascade.clients",
                    client = name,
                    kind = err.kind(),
                    "model call failed: {err}"
                );
                Err(err)
            }
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Zero-cost local client so the pipeline is runnable with nothing
/// configured.
pub struct EchoClient {
    id: String,
}

impl EchoClient {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ModelClient for EchoClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn estimate_cost_micros(&self, _prompt: &str, _opts: &GenerateOptions) -> u64 {
        0
    }

    async fn generate(
        &self,
        prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<Generation, ClientError> {
        let tokens_in = approx_tokens(prompt);
        let text = format!("Echo: {prompt}");
        Ok(Generation {
            tokens_out: approx_tokens(&text),
            tokens_in,
            text,
            cost_micros: 0,
            latency_ms: 0,
            provider_id: self.id.clone(),
        })
    }
}

/// Price table for metered HTTP clients, in micro-currency per 1k tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    pub micros_per_1k_tokens_in: u64,
    pub micros_per_1k_tokens_out: u64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            micros_per_1k_tokens_in: 500,
            micros_per_1k_tokens_out: 1_500,
        }
    }
}

/// OpenAI-compatible chat-completions client.
pub struct HttpModelClient {
    id: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    price: PriceTable,
    client: Client,
}

impl HttpModelClient {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        price: PriceTable,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: normalize_base(&base_url.into()),
            api_key,
            model: model.into(),
            price,
            client: Client::new(),
        }
    }

    fn cost_for(&self, tokens_in: u64, tokens_out: u64) -> u64 {
        tokens_in * self.price.micros_per_1k_tokens_in / 1_000
            + tokens_out * self.price.micros_per_1k_tokens_out / 1_000
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn estimate_cost_micros(&self, prompt: &str, opts: &GenerateOptions) -> u64 {
        self.cost_for(approx_tokens(prompt), u64::from(opts.max_tokens))
    }

    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<Generation, ClientError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "stream": false,
        });
        if let Some(stop) = &opts.stop {
            body["stop"] = json!(stop);
        }

        let mut req = self
            .client
            .post(url)
            .timeout(std::time::Duration::from_millis(opts.timeout_ms))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let started = Instant::now();
        let response = req.send().await.map_err(|err| {
            if err.is_timeout() {
                ClientError::Timeout(opts.timeout_ms)
            } else {
                ClientError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("request failed with status {status}"));
            return Err(match status.as_u16() {
                429 => ClientError::RateLimited(detail),
                401 | 403 => ClientError::Policy(detail),
                500..=599 | 408 => ClientError::Retryable(detail),
                _ => ClientError::Invalid(detail),
            });
        }

        if let Some(detail) = extract_error(&value) {
            return Err(ClientError::Invalid(detail));
        }

        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ClientError::Invalid(format!(
                    "no completion content for model `{}`",
                    self.model
                ))
            })?;

        let tokens_in = value["usage"]["prompt_tokens"]
            .as_u64()
            .unwrap_or_else(|| approx_tokens(prompt));
        let tokens_out = value["usage"]["completion_tokens"]
            .as_u64()
            .unwrap_or_else(|| approx_tokens(&text));

        Ok(Generation {
            cost_micros: self.cost_for(tokens_in, tokens_out),
            latency_ms: started.elapsed().as_millis() as u64,
            provider_id: self.id.clone(),
            text,
            tokens_in,
            tokens_out,
        })
    }
}

/// Rough whitespace token count for estimates and unmetered clients.
pub fn approx_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use cascade_types::Budget;

    fn meter() -> BudgetMeter {
        BudgetMeter::new(Budget::default())
    }

    async fn registry_with(name: &str, role: ModelRole, client: Arc<dyn ModelClient>) -> ClientRegistry {
        let registry = ClientRegistry::new();
        registry
            .register(
                name,
                role,
                client,
                RateLimitConfig::default(),
                CircuitBreakerConfig::default(),
            )
            .await;
        registry
    }

    #[tokio::test]
    async fn unknown_client_is_invalid() {
        let registry = ClientRegistry::new();
        let err = registry
            .generate("missing", "hi", &GenerateOptions::default(), &meter())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Invalid(_)));
    }

    #[tokio::test]
    async fn echo_client_roundtrip_costs_nothing() {
        let registry = registry_with(
            "student",
            ModelRole::Student,
            Arc::new(EchoClient::new("echo-local")),
        )
        .await;
        let budget = meter();
        let generation = registry
            .generate("student", "2+2=?", &GenerateOptions::default(), &budget)
            .await
            .unwrap();
        assert!(generation.text.contains("2+2=?"));
        assert_eq!(budget.totals().cost_micros, 0);
        assert_eq!(budget.totals().student_calls, 1);
    }

    #[tokio::test]
    async fn call_over_remaining_cost_is_refused_synchronously() {
        let client = Arc::new(ScriptedClient::new("teacher-model", 10_000));
        client.push_ok("never sent", 10_000);
        let registry = registry_with("teacher", ModelRole::Teacher, client.clone()).await;

        let budget = BudgetMeter::new(Budget {
            max_cost_micros: 100,
            ..Budget::default()
        });
        let err = registry
            .generate("teacher", "prompt", &GenerateOptions::default(), &budget)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BudgetExceeded(_)));
        assert_eq!(client.calls(), 0, "refusal must happen before dispatch");
        assert_eq!(budget.totals().teacher_calls, 0);
    }

    #[tokio::test]
    async fn teacher_call_budget_zero_refuses() {
        let registry = registry_with(
            "teacher",
            ModelRole::Teacher,
            Arc::new(EchoClient::new("echo")),
        )
        .await;
        let budget = BudgetMeter::new(Budget {
            max_teacher_calls: 0,
            ..Budget::default()
        });
        let err = registry
            .generate("teacher", "prompt", &GenerateOptions::default(), &budget)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BudgetExceeded(_)));
    }

    #[tokio::test]
    async fn forced_open_circuit_rejects_calls() {
        let registry = registry_with(
            "teacher",
            ModelRole::Teacher,
            Arc::new(EchoClient::new("echo")),
        )
        .await;
        registry.force_circuit_open("teacher").await;
        let err = registry
            .generate("teacher", "prompt", &GenerateOptions::default(), &meter())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn repeated_transport_failures_open_the_circuit() {
        let client = Arc::new(ScriptedClient::new("flaky", 0));
        for _ in 0..5 {
            client.push_err(ClientError::Transport("connection reset".into()));
        }
        let registry = ClientRegistry::new();
        registry
            .register(
                "teacher",
                ModelRole::Teacher,
                client,
                RateLimitConfig::default(),
                CircuitBreakerConfig {
                    failure_threshold: 3,
                    ..CircuitBreakerConfig::default()
                },
            )
            .await;

        let budget = meter();
        for _ in 0..3 {
            let _ = registry
                .generate("teacher", "p", &GenerateOptions::default(), &budget)
                .await;
        }
        assert_eq!(
            registry.circuit_state("teacher").await,
            Some(CircuitState::Open)
        );
        let err = registry
            .generate("teacher", "p", &GenerateOptions::default(), &budget)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn failed_call_releases_reservation() {
        let client = Arc::new(ScriptedClient::new("flaky", 0));
        client.push_err(ClientError::Retryable("bad gateway".into()));
        client.push_ok("recovered", 0);
        let registry = registry_with("teacher", ModelRole::Teacher, client).await;

        let budget = BudgetMeter::new(Budget {
            max_teacher_calls: 1,
            ..Budget::default()
        });
        let err = registry
            .generate("teacher", "p", &GenerateOptions::default(), &budget)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // The failed attempt gave its slot back; the retry succeeds.
        let generation = registry
            .generate("teacher", "p", &GenerateOptions::default(), &budget)
            .await
            .unwrap();
        assert_eq!(generation.text, "recovered");
        assert_eq!(budget.totals().teacher_calls, 1);
    }
}
