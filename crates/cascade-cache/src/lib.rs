//! Result cache for deterministic stage invocations.
//!
//! Keys are SHA-256 digests of (stage name, normalized inputs, config
//! digest, client identity). Entries carry a TTL and are expired lazily on
//! access; a size cap triggers least-recently-used eviction. Concurrent
//! `get_or_compute` calls on one key collapse into a single compute via a
//! per-key broadcast channel; a compute error reaches every current waiter
//! and is never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Cloneable failure handed to every caller sharing a failed compute.
/// `kind` round-trips the producer's error classification.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ComputeFailure {
    pub kind: String,
    pub message: String,
}

impl ComputeFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            default_ttl_ms: 10 * 60 * 1000,
        }
    }
}

/// Value plus whether this caller observed a hit. Single-flight waiters
/// count as hits: their result came from someone else's compute.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub value: Value,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry {
    value: Value,
    expires_at: Instant,
    last_access: u64,
    size_bytes: usize,
}

type FlightResult = Result<Value, ComputeFailure>;
type FlightMap = HashMap<String, broadcast::Sender<FlightResult>>;

/// Removes the leader's inflight slot if the compute future is dropped
/// before completing (timeout, cancellation). Dropping the sender wakes
/// every waiter with a recv error, so nobody hangs on an abandoned flight.
struct FlightGuard {
    inflight: Arc<std::sync::Mutex<FlightMap>>,
    key: String,
    armed: bool,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut map) = self.inflight.lock() {
                map.remove(&self.key);
            }
        }
    }
}

#[derive(Clone)]
pub struct ResultCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    inflight: Arc<std::sync::Mutex<FlightMap>>,
    access_counter: Arc<AtomicU64>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    config: Arc<CacheConfig>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            inflight: Arc::new(std::sync::Mutex::new(HashMap::new())),
            access_counter: Arc::new(AtomicU64::new(0)),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            config: Arc::new(config),
        }
    }

    pub fn default_ttl_ms(&self) -> u64 {
        self.config.default_ttl_ms
    }

    /// Plain lookup. Expired entries are removed on the way out.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_access = self.access_counter.fetch_add(1, Ordering::SeqCst);
                self.hits.fetch_add(1, Ordering::SeqCst);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::SeqCst);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    /// Fetch from cache or run `compute` exactly once across concurrent
    /// callers of the same key. Errors are surfaced to all current waiters
    /// and never cached, so the next caller retries.
    pub async fn get_or_compute<F>(
        &self,
        key: &str,
        ttl_ms: u64,
        compute: F,
    ) -> Result<CacheLookup, ComputeFailure>
    where
        F: Future<Output = FlightResult>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(CacheLookup {
                value,
                cache_hit: true,
            });
        }

        // Either become the leader for this key or join the flight in
        // progress. The subscription is taken under the inflight lock so a
        // leader finishing in between cannot strand us.
        let waiter = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = inflight.get(key) {
                Some(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                inflight.insert(key.to_string(), tx);
                None
            }
        };

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(Ok(value)) => {
                    self.hits.fetch_add(1, Ordering::SeqCst);
                    Ok(CacheLookup {
                        value,
                        cache_hit: true,
                    })
                }
                Ok(Err(failure)) => Err(failure),
                // Leader abandoned the flight (dropped mid-compute). The
                // kind is retryable so idempotent callers try again.
                Err(_) => Err(ComputeFailure::new(
                    "retryable",
                    "shared compute abandoned before producing a result",
                )),
            };
        }

        let mut flight_guard = FlightGuard {
            inflight: self.inflight.clone(),
            key: key.to_string(),
            armed: true,
        };

        let result = compute.await;

        if let Ok(value) = &result {
            self.insert(key, value.clone(), ttl_ms).await;
        }

        let tx = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.remove(key)
        };
        flight_guard.armed = false;
        if let Some(tx) = tx {
            let _ = tx.send(result.clone());
        }

        result.map(|value| CacheLookup {
            value,
            cache_hit: false,
        })
    }

    async fn insert(&self, key: &str, value: Value, ttl_ms: u64) {
        let size_bytes = value.to_string().len();
        let mut entries = self.entries.lock().await;

        let now = Instant::now();
        if entries.len() >= self.config.max_entries {
            entries.retain(|_, e| e.expires_at > now);
        }
        while entries.len() >= self.config.max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                target: "cascade.cache",
                key = %oldest,
                "evicted least-recently-used entry"
            );
        }

        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + Duration::from_millis(ttl_ms),
                last_access: self.access_counter.fetch_add(1, Ordering::SeqCst),
                size_bytes,
            },
        );
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        CacheStats {
            entries: entries.len(),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
        }
    }

    pub async fn size_bytes(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().map(|e| e.size_bytes).sum()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// Collapse text for semantically-safe key material: trim, lowercase,
/// squeeze internal whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical string form of a JSON value. Object keys serialize sorted, so
/// structurally-equal inputs hash identically.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Build a cache key from the stage identity and its normalized inputs.
pub fn cache_key(stage: &str, inputs: &Value, config_digest: &str, client_identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(inputs).as_bytes());
    hasher.update(b"|");
    hasher.update(config_digest.as_bytes());
    hasher.update(b"|");
    hasher.update(client_identity.as_bytes());
    format!("{:064x}", hasher.finalize())
}

/// Digest of a stage config value, for key material.
pub fn config_digest(config: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(config).as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache_with(max_entries: usize, ttl_ms: u64) -> ResultCache {
        ResultCache::new(CacheConfig {
            max_entries,
            default_ttl_ms: ttl_ms,
        })
    }

    #[tokio::test]
    async fn get_or_compute_roundtrip() {
        let cache = cache_with(16, 60_000);
        let first = cache
            .get_or_compute("k1", 60_000, async { Ok(json!({"answer": 42})) })
            .await
            .unwrap();
        assert!(!first.cache_hit);

        let second = cache
            .get_or_compute("k1", 60_000, async {
                panic!("must not recompute within ttl")
            })
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.value, json!({"answer": 42}));
    }

    #[tokio::test]
    async fn expired_entry_recomputes() {
        let cache = cache_with(16, 0);
        cache
            .get_or_compute("k1", 0, async { Ok(json!(1)) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = cache
            .get_or_compute("k1", 0, async { Ok(json!(2)) })
            .await
            .unwrap();
        assert!(!second.cache_hit);
        assert_eq!(second.value, json!(2));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_compute() {
        let cache = cache_with(16, 60_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let a = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("shared", 60_000, async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(json!("computed"))
                    })
                    .await
            })
        };
        let b = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                cache
                    .get_or_compute("shared", 60_000, async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("computed"))
                    })
                    .await
            })
        };

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.value, second.value);
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
    }

    #[tokio::test]
    async fn compute_error_is_not_cached() {
        let cache = cache_with(16, 60_000);
        let err = cache
            .get_or_compute("k1", 60_000, async {
                Err(ComputeFailure::new("transport", "upstream reset"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, "transport");

        // Key is not poisoned; next caller computes fresh.
        let ok = cache
            .get_or_compute("k1", 60_000, async { Ok(json!("recovered")) })
            .await
            .unwrap();
        assert!(!ok.cache_hit);
        assert_eq!(ok.value, json!("recovered"));
    }

    #[tokio::test]
    async fn lru_eviction_respects_max_entries() {
        let cache = cache_with(3, 60_000);
        for i in 0..5 {
            cache
                .get_or_compute(&format!("k{i}"), 60_000, async move { Ok(json!(i)) })
                .await
                .unwrap();
        }
        let stats = cache.stats().await;
        assert!(stats.entries <= 3, "cache must not exceed max_entries");
        assert!(stats.evictions >= 2);
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        assert_eq!(normalize_text("  What   is\tRAFT? "), "what is raft?");
    }

    #[test]
    fn cache_key_is_stable_across_input_form() {
        let a = cache_key(
            "retrieve",
            &json!({"b": 1, "a": 2}),
            "cfg",
            "client",
        );
        let b = cache_key(
            "retrieve",
            &serde_json::from_str::<Value>("{\"a\":2,\"b\":1}").unwrap(),
            "cfg",
            "client",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn cache_key_varies_by_stage_and_client() {
        let base = cache_key("retrieve", &json!(1), "cfg", "client");
        assert_ne!(base, cache_key("expand", &json!(1), "cfg", "client"));
        assert_ne!(base, cache_key("retrieve", &json!(1), "cfg", "other"));
    }
}
