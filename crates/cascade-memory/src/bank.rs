// Memory bank
// High-level coordinator over the note store and embedder: dedup-merging
// upserts, similarity search, and counter curation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::embeddings::{cosine_similarity, Embedder};
use crate::store::NoteStore;
use crate::types::{
    MemoryError, MemoryNote, MemoryResult, MemoryStats, NoteMatch, UpsertOutcome,
    DEFAULT_MERGE_THRESHOLD,
};

#[derive(Debug, Clone)]
pub struct MemoryBankConfig {
    /// Similarity at or above which an upsert merges instead of inserting.
    /// Valid range [0.5, 0.99].
    pub merge_threshold: f32,
    /// Harmful marks at which the curator tombstones a note, provided they
    /// outnumber helpful marks.
    pub harmful_tombstone_min: i64,
}

impl Default for MemoryBankConfig {
    fn default() -> Self {
        Self {
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            harmful_tombstone_min: 3,
        }
    }
}

impl MemoryBankConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if !(0.5..=0.99).contains(&self.merge_threshold) {
            return Err(MemoryError::InvalidConfig(format!(
                "merge_threshold {} outside [0.5, 0.99]",
                self.merge_threshold
            )));
        }
        Ok(())
    }
}

/// The reasoning bank. Shared across sessions; writes to one
/// (tenant, domain) bucket are serialized by an advisory lock so concurrent
/// upserts cannot slip duplicate near-identical notes past the merge check.
pub struct MemoryBank {
    store: NoteStore,
    embedder: Arc<dyn Embedder>,
    config: MemoryBankConfig,
    bucket_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryBank {
    pub fn new(
        store: NoteStore,
        embedder: Arc<dyn Embedder>,
        config: MemoryBankConfig,
    ) -> MemoryResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            embedder,
            config,
            bucket_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    async fn bucket_lock(&self, tenant: &str, domain: &str) -> Arc<Mutex<()>> {
        let key = format!("{tenant}/{domain}");
        let mut locks = self.bucket_locks.lock().await;
        locks.entry(key).or_default().clone()
    }

    /// Store a note, merging into an existing near-duplicate of the same
    /// tenant+domain when similarity reaches the threshold. On merge the
    /// embedding is re-computed; helpful_count moves only when the caller
    /// declared the note helpful.
    pub async fn upsert(
        &self,
        tenant: &str,
        domain: &str,
        text: &str,
        helpful: bool,
    ) -> MemoryResult<UpsertOutcome> {
        let embedding = self.embedder.embed(text).await?;
        let guard = self.bucket_lock(tenant, domain).await;
        let _held = guard.lock().await;

        let candidates = self.store.candidates(tenant, Some(domain)).await?;
        let best = candidates
            .iter()
            .map(|note| (note, cosine_similarity(&embedding, &note.embedding)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((existing, similarity)) = best {
            if similarity >= self.config.merge_threshold {
                self.store.set_embedding(&existing.id, &embedding).await?;
                if helpful {
                    self.store.adjust_counters(&existing.id, 1, 0).await?;
                }
                tracing::debug!(
                    target: "cascade.memory",
                    note_id = %existing.id,
                    similarity,
                    "merged upsert into existing note"
                );
                return Ok(UpsertOutcome {
                    id: existing.id.clone(),
                    merged: true,
                });
            }
        }

        let note = MemoryNote {
            id: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.to_string(),
            domain: domain.to_string(),
            embedding,
            text: text.to_string(),
            created_at: Utc::now(),
            helpful_count: i64::from(helpful),
            harmful_count: 0,
            tombstoned_at: None,
        };
        self.store.insert(&note).await?;
        Ok(UpsertOutcome {
            id: note.id,
            merged: false,
        })
    }

    /// Top-k notes by cosine similarity. A broken backing store yields an
    /// empty result set, never an error; retrieval must not block the
    /// pipeline.
    pub async fn search_similar(
        &self,
        query_embedding: &[f32],
        tenant: &str,
        domain: Option<&str>,
        k: usize,
    ) -> Vec<NoteMatch> {
        let candidates = match self.store.candidates(tenant, domain).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(
                    target: "cascade.memory",
                    tenant,
                    "memory search degraded to empty: {err}"
                );
                return Vec::new();
            }
        };

        let mut matches: Vec<NoteMatch> = candidates
            .into_iter()
            .map(|note| {
                let similarity = cosine_similarity(query_embedding, &note.embedding);
                NoteMatch { note, similarity }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        matches
    }

    /// Embed the query text and search. Embedding failure degrades to empty.
    pub async fn search_text(
        &self,
        query: &str,
        tenant: &str,
        domain: Option<&str>,
        k: usize,
    ) -> Vec<NoteMatch> {
        match self.embedder.embed(query).await {
            Ok(embedding) => self.search_similar(&embedding, tenant, domain, k).await,
            Err(err) => {
                tracing::warn!(
                    target: "cascade.memory",
                    "query embedding failed, returning no notes: {err}"
                );
                Vec::new()
            }
        }
    }

    pub async fn mark_helpful(&self, id: &str) -> MemoryResult<()> {
        self.store.adjust_counters(id, 1, 0).await?;
        Ok(())
    }

    /// Record a harmful mark. Past the curation threshold, and once harmful
    /// marks outnumber helpful ones, the note is tombstoned.
    pub async fn mark_harmful(&self, id: &str) -> MemoryResult<()> {
        let (helpful, harmful) = self.store.adjust_counters(id, 0, 1).await?;
        if harmful >= self.config.harmful_tombstone_min && harmful > helpful {
            self.store.tombstone(id, Utc::now()).await?;
            tracing::info!(
                target: "cascade.memory",
                note_id = %id,
                helpful,
                harmful,
                "curator tombstoned harmful note"
            );
        }
        Ok(())
    }

    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;

    fn bank() -> MemoryBank {
        MemoryBank::new(
            NoteStore::open_in_memory().unwrap(),
            Arc::new(HashEmbedder::new()),
            MemoryBankConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn near_duplicate_upsert_merges() {
        let bank = bank();
        let first = bank
            .upsert("acme", "general", "the sky is blue", false)
            .await
            .unwrap();
        assert!(!first.merged);

        let second = bank
            .upsert("acme", "general", "The sky is blue.", true)
            .await
            .unwrap();
        assert!(second.merged);
        assert_eq!(second.id, first.id);

        let stats = bank.stats().await.unwrap();
        assert_eq!(stats.total_notes, 1);
    }

    #[tokio::test]
    async fn plain_re_upsert_leaves_helpful_count_unchanged() {
        let bank = bank();
        let first = bank
            .upsert("acme", "general", "raft elects a leader", false)
            .await
            .unwrap();
        bank.upsert("acme", "general", "raft elects a leader", false)
            .await
            .unwrap();

        let matches = bank
            .search_text("raft elects a leader", "acme", Some("general"), 4)
            .await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].note.id, first.id);
        assert_eq!(matches[0].note.helpful_count, 0);
    }

    #[tokio::test]
    async fn distinct_notes_both_stored_and_ranked() {
        let bank = bank();
        bank.upsert("acme", "general", "raft consensus uses terms and log replication", false)
            .await
            .unwrap();
        bank.upsert("acme", "general", "bread rises because of yeast fermentation", false)
            .await
            .unwrap();

        let matches = bank
            .search_text("how does raft consensus replicate logs", "acme", None, 2)
            .await;
        assert_eq!(matches.len(), 2);
        assert!(matches[0].note.text.contains("raft"));
        assert!(matches[0].similarity >= matches[1].similarity);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let bank = bank();
        bank.upsert("acme", "general", "internal acme fact", false)
            .await
            .unwrap();
        let matches = bank.search_text("internal acme fact", "zeta", None, 5).await;
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn harmful_marks_tombstone_past_threshold() {
        let bank = bank();
        let note = bank
            .upsert("acme", "general", "misleading claim", false)
            .await
            .unwrap();
        for _ in 0..3 {
            bank.mark_harmful(&note.id).await.unwrap();
        }
        let matches = bank.search_text("misleading claim", "acme", None, 5).await;
        assert!(matches.is_empty(), "tombstoned notes must not be retrieved");

        let stats = bank.stats().await.unwrap();
        assert_eq!(stats.tombstoned_notes, 1);
    }

    #[tokio::test]
    async fn invalid_merge_threshold_is_rejected() {
        let result = MemoryBank::new(
            NoteStore::open_in_memory().unwrap(),
            Arc::new(HashEmbedder::new()),
            MemoryBankConfig {
                merge_threshold: 0.2,
                ..MemoryBankConfig::default()
            },
        );
        assert!(matches!(result, Err(MemoryError::InvalidConfig(_))));
    }
}
