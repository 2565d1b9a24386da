//! Session trace store: a bounded in-memory ring of finished sessions plus
//! the live table of running ones. Event sequence numbers are assigned here,
//! under the store lock, so consumers can rely on total per-session order.
//! Closed sessions can optionally be appended to a JSONL file for durable
//! trace.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use cascade_types::{PipelineResult, Session, StageEvent, TerminalState, Totals};

use crate::logging::emit_stage_event;

#[derive(Debug, Clone)]
pub struct TraceStoreConfig {
    /// How many closed sessions the ring retains.
    pub max_sessions: usize,
    /// When set, every closed session is appended to this JSONL file.
    pub append_log_path: Option<PathBuf>,
}

impl Default for TraceStoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            append_log_path: None,
        }
    }
}

struct ActiveSession {
    session: Session,
    next_seq: u64,
}

#[derive(Default)]
struct TraceInner {
    active: HashMap<String, ActiveSession>,
    closed: VecDeque<Session>,
}

/// Process-wide trace substrate shared by all sessions.
#[derive(Clone)]
pub struct TraceStore {
    inner: Arc<Mutex<TraceInner>>,
    config: Arc<TraceStoreConfig>,
}

impl TraceStore {
    pub fn new(config: TraceStoreConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TraceInner::default())),
            config: Arc::new(config),
        }
    }

    pub async fn begin(&self, session: Session) {
        let mut inner = self.inner.lock().await;
        inner.active.insert(
            session.id.clone(),
            ActiveSession {
                session,
                next_seq: 0,
            },
        );
    }

    /// Append an event to a running session, assigning its sequence number.
    /// Returns the assigned seq, or None when the session is unknown.
    pub async fn append_event(&self, mut event: StageEvent) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        let active = inner.active.get_mut(&event.session_id)?;
        event.seq = active.next_seq;
        active.next_seq += 1;
        emit_stage_event(&event);
        let seq = event.seq;
        active.session.events.push(event);
        Some(seq)
    }

    /// Close a session: stamp outcome, move it into the ring, and append it
    /// to the durable log when configured.
    pub async fn close(
        &self,
        session_id: &str,
        scratchpad: serde_json::Map<String, serde_json::Value>,
        totals: Totals,
        final_result: Option<PipelineResult>,
        terminal_state: TerminalState,
        ended_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.active.remove(session_id) else {
            return;
        };
        let mut session = active.session;
        session.scratchpad = scratchpad;
        session.totals = totals;
        session.final_result = final_result;
        session.terminal_state = Some(terminal_state);
        session.ended_at = Some(ended_at);

        if let Some(path) = &self.config.append_log_path {
            if let Err(err) = append_jsonl(path, &session) {
                tracing::warn!(
                    target: "cascade.trace",
                    session_id = %session.id,
                    "failed to append session to trace log: {err}"
                );
            }
        }

        inner.closed.push_back(session);
        while inner.closed.len() > self.config.max_sessions {
            inner.closed.pop_front();
        }
    }

    /// Fetch a session by id, running or closed.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let inner = self.inner.lock().await;
        if let Some(active) = inner.active.get(session_id) {
            return Some(active.session.clone());
        }
        inner
            .closed
            .iter()
            .rev()
            .find(|s| s.id == session_id)
            .cloned()
    }

    pub async fn closed_count(&self) -> usize {
        self.inner.lock().await.closed.len()
    }
}

fn append_jsonl(path: &PathBuf, session: &Session) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(session).map_err(std::io::Error::other)?;
    writeln!(file, "{line}")
}
