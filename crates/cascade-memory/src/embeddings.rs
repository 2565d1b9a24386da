// Embedding adapters
// The engine treats the embedder as a pluggable adapter with deterministic
// output for identical input. The built-in implementation is a feature-hash
// projection, so retrieval works with no model runtime attached.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::{MemoryResult, DEFAULT_EMBEDDING_DIMENSION};

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>>;
}

/// Deterministic feature-hashing embedder. Tokens are lowercased
/// alphanumeric runs; each token hashes to a bucket and a sign, and the
/// resulting vector is L2-normalized. Identical input always yields the
/// identical vector.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::with_dimension(DEFAULT_EMBEDDING_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dimension;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        Ok(self.project(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn l2_normalize(vector: &mut [f32]) {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

/// Calculate cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        0.0
    } else {
        dot_product / (magnitude_a * magnitude_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_input_embeds_identically() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("The sky is blue").await.unwrap();
        let b = embedder.embed("The sky is blue").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_EMBEDDING_DIMENSION);
    }

    #[tokio::test]
    async fn case_and_punctuation_do_not_change_projection() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("the sky is blue").await.unwrap();
        let b = embedder.embed("The sky is blue.").await.unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unrelated_texts_are_dissimilar() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed("raft consensus leader election").await.unwrap();
        let b = embedder.embed("sourdough starter hydration").await.unwrap();
        assert!(cosine_similarity(&a, &b) < 0.5);
    }

    #[test]
    fn cosine_similarity_bounds() {
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![1.0f32, 0.0, 0.0];
        let c = vec![0.0f32, 1.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }
}
