use serde::Serialize;
use thiserror::Error;

use cascade_clients::ClientError;

/// Stage failure classification. The scheduler dispatches on this: transient
/// kinds retry (idempotent stages only), the rest degrade or terminate per
/// stage severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    Retryable,
    RateLimited,
    Transport,
    CircuitOpen,
    Policy,
    Invalid,
    Budget,
    Cancelled,
    Internal,
}

impl StageErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageErrorKind::Retryable => "retryable",
            StageErrorKind::RateLimited => "rate_limited",
            StageErrorKind::Transport => "transport",
            StageErrorKind::CircuitOpen => "circuit_open",
            StageErrorKind::Policy => "policy",
            StageErrorKind::Invalid => "invalid",
            StageErrorKind::Budget => "budget",
            StageErrorKind::Cancelled => "cancelled",
            StageErrorKind::Internal => "internal",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StageErrorKind::Retryable | StageErrorKind::RateLimited | StageErrorKind::Transport
        )
    }

    /// Inverse of `as_str`, for kinds that round-tripped through the cache
    /// coordination layer.
    pub fn parse(value: &str) -> Self {
        match value {
            "retryable" => StageErrorKind::Retryable,
            "rate_limited" => StageErrorKind::RateLimited,
            "transport" => StageErrorKind::Transport,
            "circuit_open" => StageErrorKind::CircuitOpen,
            "policy" => StageErrorKind::Policy,
            "invalid" => StageErrorKind::Invalid,
            "budget" => StageErrorKind::Budget,
            "cancelled" => StageErrorKind::Cancelled,
            _ => StageErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{} error: {message}", kind.as_str())]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Retryable, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Invalid, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Internal, message)
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Budget, message)
    }

    pub fn cancelled() -> Self {
        Self::new(StageErrorKind::Cancelled, "stage cancelled")
    }
}

impl From<ClientError> for StageError {
    fn from(err: ClientError) -> Self {
        let kind = match &err {
            ClientError::Transport(_) => StageErrorKind::Transport,
            ClientError::RateLimited(_) => StageErrorKind::RateLimited,
            ClientError::Retryable(_) | ClientError::Timeout(_) => StageErrorKind::Retryable,
            ClientError::CircuitOpen(_) => StageErrorKind::CircuitOpen,
            ClientError::Policy(_) => StageErrorKind::Policy,
            ClientError::Invalid(_) => StageErrorKind::Invalid,
            ClientError::BudgetExceeded(_) => StageErrorKind::Budget,
        };
        StageError::new(kind, err.to_string())
    }
}

/// Errors that surface synchronously from the facade, before a session
/// exists. Everything later is folded into the result's terminal state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input error: {0}")]
    Input(String),

    #[error("planning error: {0}")]
    Planning(String),

    #[error("internal error: {0}")]
    Internal(String),
}
