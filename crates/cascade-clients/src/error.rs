use thiserror::Error;

/// Typed model-call failure. The scheduler's retry/degrade policy and the
/// circuit breaker both dispatch on the kind, so classification is part of
/// the contract, not a diagnostic nicety.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("circuit open for client `{0}`")]
    CircuitOpen(String),

    #[error("policy refusal: {0}")]
    Policy(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("retryable upstream error: {0}")]
    Retryable(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("call timed out after {0} ms")]
    Timeout(u64),
}

impl ClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Transport(_) => "transport",
            ClientError::RateLimited(_) => "rate_limited",
            ClientError::CircuitOpen(_) => "circuit_open",
            ClientError::Policy(_) => "policy",
            ClientError::Invalid(_) => "invalid",
            ClientError::Retryable(_) => "retryable",
            ClientError::BudgetExceeded(_) => "budget_exceeded",
            ClientError::Timeout(_) => "timeout",
        }
    }

    /// Transient failures worth another attempt. Policy and validation
    /// refusals are final by definition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::RateLimited(_)
                | ClientError::Retryable(_)
                | ClientError::Timeout(_)
        )
    }

    /// Failures the circuit breaker counts against the downstream. Local
    /// refusals (rate limit, budget, validation) say nothing about its
    /// health.
    pub fn counts_against_circuit(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Retryable(_) | ClientError::Timeout(_)
        )
    }
}
