//! Deterministic clients for tests: a scripted client replays a fixed
//! sequence of outcomes so retry, circuit and fallback paths can be driven
//! without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::{approx_tokens, GenerateOptions, Generation, ModelClient};

pub struct ScriptedClient {
    id: String,
    cost_estimate: u64,
    script: Mutex<VecDeque<Result<Generation, ClientError>>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(id: impl Into<String>, cost_estimate: u64) -> Self {
        Self {
            id: id.into(),
            cost_estimate,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_ok(&self, text: &str, cost_micros: u64) {
        let generation = Generation {
            text: text.to_string(),
            tokens_in: 8,
            tokens_out: approx_tokens(text),
            cost_micros,
            latency_ms: 1,
            provider_id: self.id.clone(),
        };
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(generation));
    }

    pub fn push_err(&self, err: ClientError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(err));
    }

    /// How many times `generate` was actually invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn estimate_cost_micros(&self, _prompt: &str, _opts: &GenerateOptions) -> u64 {
        self.cost_estimate
    }

    async fn generate(
        &self,
        prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<Generation, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(outcome) => outcome,
            // Script exhausted: echo, so long tests keep a sane default.
            None => Ok(Generation {
                text: format!("scripted: {prompt}"),
                tokens_in: approx_tokens(prompt),
                tokens_out: 4,
                cost_micros: 0,
                latency_ms: 1,
                provider_id: self.id.clone(),
            }),
        }
    }
}
