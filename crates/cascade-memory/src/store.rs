//! SQLite-backed note store. One row per note; embeddings are stored as
//! little-endian f32 blobs. Tombstoning is soft: rows are flagged, never
//! deleted, so the audit trail survives curation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::types::{MemoryError, MemoryNote, MemoryResult, MemoryStats};

pub struct NoteStore {
    conn: Arc<Mutex<Connection>>,
}

impl NoteStore {
    /// Open (or create) the note database at `path`.
    pub async fn open(path: &Path) -> MemoryResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(MemoryError::Io)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Volatile store for tests and ephemeral runs.
    pub fn open_in_memory() -> MemoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> MemoryResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notes (
                id             TEXT PRIMARY KEY,
                tenant         TEXT NOT NULL,
                domain         TEXT NOT NULL,
                embedding      BLOB NOT NULL,
                text           TEXT NOT NULL,
                created_at     TEXT NOT NULL,
                helpful_count  INTEGER NOT NULL DEFAULT 0,
                harmful_count  INTEGER NOT NULL DEFAULT 0,
                tombstoned_at  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_notes_bucket ON notes(tenant, domain);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert(&self, note: &MemoryNote) -> MemoryResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO notes
             (id, tenant, domain, embedding, text, created_at, helpful_count, harmful_count, tombstoned_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                note.id,
                note.tenant,
                note.domain,
                encode_embedding(&note.embedding),
                note.text,
                note.created_at.to_rfc3339(),
                note.helpful_count,
                note.harmful_count,
                note.tombstoned_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// All live (non-tombstoned) notes for a tenant, optionally narrowed to
    /// one domain. Candidates for similarity scans.
    pub async fn candidates(
        &self,
        tenant: &str,
        domain: Option<&str>,
    ) -> MemoryResult<Vec<MemoryNote>> {
        let conn = self.conn.lock().await;
        let mut notes = Vec::new();

        match domain {
            Some(domain) => {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant, domain, embedding, text, created_at,
                            helpful_count, harmful_count, tombstoned_at
                     FROM notes
                     WHERE tenant = ?1 AND domain = ?2 AND tombstoned_at IS NULL",
                )?;
                let rows = stmt.query_map(params![tenant, domain], row_to_note)?;
                for row in rows {
                    notes.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant, domain, embedding, text, created_at,
                            helpful_count, harmful_count, tombstoned_at
                     FROM notes
                     WHERE tenant = ?1 AND tombstoned_at IS NULL",
                )?;
                let rows = stmt.query_map(params![tenant], row_to_note)?;
                for row in rows {
                    notes.push(row?);
                }
            }
        }

        Ok(notes)
    }

    pub async fn get(&self, id: &str) -> MemoryResult<Option<MemoryNote>> {
        let conn = self.conn.lock().await;
        let note = conn
            .query_row(
                "SELECT id, tenant, domain, embedding, text, created_at,
                        helpful_count, harmful_count, tombstoned_at
                 FROM notes WHERE id = ?1",
                params![id],
                row_to_note,
            )
            .optional()?;
        Ok(note)
    }

    /// Adjust counters atomically. Returns the post-update counter pair.
    pub async fn adjust_counters(
        &self,
        id: &str,
        helpful_delta: i64,
        harmful_delta: i64,
    ) -> MemoryResult<(i64, i64)> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE notes
             SET helpful_count = helpful_count + ?1,
                 harmful_count = harmful_count + ?2
             WHERE id = ?3",
            params![helpful_delta, harmful_delta, id],
        )?;
        if affected == 0 {
            return Err(MemoryError::NotFound(format!("note {id}")));
        }
        let counters = conn.query_row(
            "SELECT helpful_count, harmful_count FROM notes WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counters)
    }

    /// Replace a note's embedding (re-computed on merge).
    pub async fn set_embedding(&self, id: &str, embedding: &[f32]) -> MemoryResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE notes SET embedding = ?1 WHERE id = ?2",
            params![encode_embedding(embedding), id],
        )?;
        if affected == 0 {
            return Err(MemoryError::NotFound(format!("note {id}")));
        }
        Ok(())
    }

    pub async fn tombstone(&self, id: &str, at: DateTime<Utc>) -> MemoryResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE notes SET tombstoned_at = ?1 WHERE id = ?2 AND tombstoned_at IS NULL",
            params![at.to_rfc3339(), id],
        )?;
        if affected == 0 {
            return Err(MemoryError::NotFound(format!("live note {id}")));
        }
        Ok(())
    }

    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        let conn = self.conn.lock().await;
        let total_notes: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |r| r.get(0))?;
        let tombstoned_notes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE tombstoned_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(MemoryStats {
            total_notes,
            tombstoned_notes,
        })
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNote> {
    let embedding_bytes: Vec<u8> = row.get(3)?;
    let created_at: String = row.get(5)?;
    let tombstoned_at: Option<String> = row.get(8)?;
    Ok(MemoryNote {
        id: row.get(0)?,
        tenant: row.get(1)?,
        domain: row.get(2)?,
        embedding: decode_embedding(&embedding_bytes),
        text: row.get(4)?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        helpful_count: row.get(6)?,
        harmful_count: row.get(7)?,
        tombstoned_at: tombstoned_at.and_then(|t| t.parse::<DateTime<Utc>>().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, tenant: &str, domain: &str, text: &str) -> MemoryNote {
        MemoryNote {
            id: id.to_string(),
            tenant: tenant.to_string(),
            domain: domain.to_string(),
            embedding: vec![1.0, 0.0, 0.0],
            text: text.to_string(),
            created_at: Utc::now(),
            helpful_count: 0,
            harmful_count: 0,
            tombstoned_at: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let store = NoteStore::open_in_memory().unwrap();
        store
            .insert(&note("n1", "acme", "distributed", "raft uses leader election"))
            .await
            .unwrap();
        let fetched = store.get("n1").await.unwrap().unwrap();
        assert_eq!(fetched.text, "raft uses leader election");
        assert_eq!(fetched.embedding, vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn candidates_filter_by_bucket_and_tombstone() {
        let store = NoteStore::open_in_memory().unwrap();
        store.insert(&note("n1", "acme", "a", "one")).await.unwrap();
        store.insert(&note("n2", "acme", "b", "two")).await.unwrap();
        store.insert(&note("n3", "zeta", "a", "three")).await.unwrap();
        store.tombstone("n1", Utc::now()).await.unwrap();

        let acme_all = store.candidates("acme", None).await.unwrap();
        assert_eq!(acme_all.len(), 1);
        assert_eq!(acme_all[0].id, "n2");

        let acme_a = store.candidates("acme", Some("a")).await.unwrap();
        assert!(acme_a.is_empty());
    }

    #[tokio::test]
    async fn counters_adjust_atomically() {
        let store = NoteStore::open_in_memory().unwrap();
        store.insert(&note("n1", "acme", "a", "text")).await.unwrap();
        let (helpful, harmful) = store.adjust_counters("n1", 2, 1).await.unwrap();
        assert_eq!((helpful, harmful), (2, 1));

        let missing = store.adjust_counters("nope", 1, 0).await;
        assert!(matches!(missing, Err(MemoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn notes_survive_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notes.sqlite");
        {
            let store = NoteStore::open(&path).await.unwrap();
            store
                .insert(&note("n1", "acme", "general", "durable fact"))
                .await
                .unwrap();
        }
        let reopened = NoteStore::open(&path).await.unwrap();
        let fetched = reopened.get("n1").await.unwrap().unwrap();
        assert_eq!(fetched.text, "durable fact");
    }

    #[tokio::test]
    async fn double_tombstone_errors() {
        let store = NoteStore::open_in_memory().unwrap();
        store.insert(&note("n1", "acme", "a", "text")).await.unwrap();
        store.tombstone("n1", Utc::now()).await.unwrap();
        assert!(store.tombstone("n1", Utc::now()).await.is_err());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_notes, 1);
        assert_eq!(stats.tombstoned_notes, 1);
    }
}
