use serde::{Deserialize, Serialize};

/// Feature vector the difficulty score is derived from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DifficultyFeatures {
    pub token_count: usize,
    pub entity_count: usize,
    pub multi_intent: bool,
    pub domain_uncertain: bool,
    pub context_len: usize,
}

/// Bounded difficulty estimate. Higher scores permit more expensive plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Difficulty {
    pub score: f64,
    pub features: DifficultyFeatures,
}

impl Difficulty {
    pub fn new(score: f64, features: DifficultyFeatures) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            features,
        }
    }
}
