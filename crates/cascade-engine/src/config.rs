use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cascade_types::Budget;

use crate::error::EngineError;

/// Router thresholds. Lowering a value broadens the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterThresholds {
    pub expand: f64,
    pub teacher: f64,
    pub decompose: f64,
    pub recurse: f64,
    pub context: f64,
}

impl Default for RouterThresholds {
    fn default() -> Self {
        Self {
            expand: 0.3,
            teacher: 0.5,
            decompose: 0.6,
            recurse: 0.6,
            context: 0.7,
        }
    }
}

/// Global stage enable gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureGates {
    pub expand: bool,
    pub teacher: bool,
    pub decompose: bool,
    pub recurse: bool,
    pub refine: bool,
    pub context: bool,
    pub memory: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            expand: true,
            teacher: true,
            decompose: true,
            recurse: true,
            refine: true,
            context: true,
            memory: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
            jitter_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub retry: RetrySettings,
    /// Time granted to in-flight stages after a cancel signal.
    pub stage_grace_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            stage_grace_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub default_ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            default_ttl_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    pub similarity_merge_threshold: f32,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            similarity_merge_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursionSettings {
    /// Bounded recursion depth; clamped to at most 3.
    pub depth_max: u32,
}

impl Default for RecursionSettings {
    fn default() -> Self {
        Self { depth_max: 1 }
    }
}

impl RecursionSettings {
    pub fn effective_depth(&self) -> u32 {
        self.depth_max.min(3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizeSettings {
    /// Candidate answers matching any of these patterns are rejected and
    /// synthesis falls through to the next priority source.
    pub deny_patterns: Vec<String>,
}

impl Default for SynthesizeSettings {
    fn default() -> Self {
        Self {
            deny_patterns: vec![
                r"(?i)as an ai (language )?model".to_string(),
                r"(?i)lorem ipsum".to_string(),
                r"\{\{.*\}\}".to_string(),
                r"(?i)^\s*(todo|tbd|placeholder)\b".to_string(),
            ],
        }
    }
}

/// Weights of the difficulty estimator's feature terms. All features are
/// normalized to [0,1] before weighting; the weighted sum goes through a
/// logistic squash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifficultyWeights {
    pub bias: f64,
    pub tokens: f64,
    pub entities: f64,
    pub multi_intent: f64,
    pub domain_uncertainty: f64,
    pub context: f64,
}

impl Default for DifficultyWeights {
    fn default() -> Self {
        Self {
            bias: -2.0,
            tokens: 2.5,
            entities: 1.5,
            multi_intent: 1.5,
            domain_uncertainty: 0.75,
            context: 1.0,
        }
    }
}

/// Engine configuration. Serde defaults cover every field, so a partial
/// JSON document (or none) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub router: RouterThresholds,
    pub scheduler: SchedulerSettings,
    pub cache: CacheSettings,
    pub memory: MemorySettings,
    pub budget_defaults: Budget,
    pub features: FeatureGates,
    pub recursion: RecursionSettings,
    pub synthesize: SynthesizeSettings,
    pub difficulty: DifficultyWeights,
    /// Per-tenant partial overrides, deep-merged over the base config.
    pub tenants: HashMap<String, Value>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EngineError::Input(format!("cannot read config {path:?}: {err}")))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| EngineError::Input(format!("config {path:?} is not JSON: {err}")))?;
        Self::default().apply_overrides(&value)
    }

    /// Deep-merge a partial JSON document over this config.
    pub fn apply_overrides(&self, overrides: &Value) -> Result<Self, EngineError> {
        let mut base = serde_json::to_value(self)
            .map_err(|err| EngineError::Internal(format!("config serialize: {err}")))?;
        deep_merge(&mut base, overrides);
        serde_json::from_value(base)
            .map_err(|err| EngineError::Input(format!("invalid config overrides: {err}")))
    }

    /// Effective config for one tenant: base deep-merged with the tenant's
    /// override document, when present.
    pub fn for_tenant(&self, tenant_id: &str) -> Result<Self, EngineError> {
        match self.tenants.get(tenant_id) {
            Some(overrides) => {
                let overrides = overrides.clone();
                let mut merged = self.apply_overrides(&overrides)?;
                merged.tenants.clear();
                Ok(merged)
            }
            None => Ok(self.clone()),
        }
    }
}

pub(crate) fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && patch_value.is_object() => {
                        deep_merge(base_value, patch_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
