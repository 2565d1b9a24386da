use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Circuit breaker state. Closed admits calls; Open rejects them until the
/// cool-down elapses; HalfOpen admits a single probe whose outcome decides
/// the next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures within `window` that open the circuit.
    pub failure_threshold: u32,
    /// Window in which consecutive failures accumulate.
    pub window: Duration,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(10),
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may go out right now. An open circuit past its
    /// cool-down transitions to half-open and admits the probe.
    pub async fn admit(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let window_expired = inner
                    .first_failure_at
                    .map(|at| now.duration_since(at) > self.config.window)
                    .unwrap_or(false);
                if window_expired {
                    inner.consecutive_failures = 0;
                    inner.first_failure_at = None;
                }
                if inner.first_failure_at.is_none() {
                    inner.first_failure_at = Some(now);
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
        }
    }

    /// Force the circuit open, as if the failure threshold had tripped.
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(30),
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = breaker(3, 10_000);
        for _ in 0..2 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.admit().await);
    }

    #[tokio::test]
    async fn success_resets_failure_run() {
        let breaker = breaker(3, 10_000);
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_after_cooldown() {
        let breaker = breaker(1, 5);
        breaker.record_failure().await;
        assert!(!breaker.admit().await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.admit().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = breaker(1, 5);
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.admit().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.admit().await);
    }
}
