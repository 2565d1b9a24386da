use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 5.0,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every session calling one client.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.capacity.max(1.0);
        Self {
            capacity,
            refill_per_sec: config.refill_per_sec.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Callers treat a refusal as a
    /// rate-limited (retryable) failure.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_drains_and_refuses() {
        let bucket = TokenBucket::new(RateLimitConfig {
            capacity: 2.0,
            refill_per_sec: 0.0,
        });
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(RateLimitConfig {
            capacity: 1.0,
            refill_per_sec: 1000.0,
        });
        assert!(bucket.try_acquire().await);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(bucket.try_acquire().await);
    }
}
