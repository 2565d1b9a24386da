use rand::Rng;

/// Retry envelope for retryable error kinds: at most `max_attempts` total
/// tries, exponential backoff from `base_backoff_ms` plus uniform jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            jitter_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based: the wait after the
    /// first failure is `backoff_ms(1)`).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_backoff_ms.saturating_mul(1u64 << exp);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        base.saturating_add(jitter)
    }

    pub fn retries_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff_ms: 100,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff_ms(1), 100);
        assert_eq!(policy.backoff_ms(2), 200);
        assert_eq!(policy.backoff_ms(3), 400);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 100,
            jitter_ms: 30,
        };
        for _ in 0..50 {
            let backoff = policy.backoff_ms(1);
            assert!((100..=130).contains(&backoff));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff_ms: 1,
            jitter_ms: 0,
        };
        assert!(policy.retries_left(1));
        assert!(!policy.retries_left(2));
    }
}
