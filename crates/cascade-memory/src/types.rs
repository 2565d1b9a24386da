// Memory bank types
// Note model and error types for the memory subsystem

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A durable note in the reasoning bank. Append-only with soft tombstones;
/// never physically deleted within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNote {
    pub id: String,
    pub tenant: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub helpful_count: i64,
    pub harmful_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstoned_at: Option<DateTime<Utc>>,
}

/// Search result with cosine similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteMatch {
    pub note: MemoryNote,
    pub similarity: f32,
}

/// What an upsert did: stored a fresh note or merged into a near-duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub id: String,
    pub merged: bool,
}

/// Bank-level statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_notes: i64,
    pub tombstoned_notes: i64,
}

/// Memory error types
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Default embedding dimension of the built-in feature-hash embedder.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

/// Default similarity above which an upsert merges into an existing note.
pub const DEFAULT_MERGE_THRESHOLD: f32 = 0.8;
