//! Process logging. Each process writes two daily-rolling JSONL streams:
//! a diagnostics file carrying everything the filter admits, and a
//! dedicated trace file carrying only `cascade.trace` stage events, so
//! telemetry shippers can tail session events without parsing general
//! logs. Raw prompt/answer text never reaches either stream; it is
//! fingerprinted first.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cascade_types::{StageEvent, StagePhase};

/// Target the trace stream is keyed on. Stage events are emitted here and
/// nowhere else; the diagnostics stream excludes it.
pub const TRACE_TARGET: &str = "cascade.trace";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

/// Keeps both non-blocking writers alive for the life of the process.
pub struct LoggingGuards {
    _diagnostics: WorkerGuard,
    _trace: WorkerGuard,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub diagnostics_prefix: String,
    pub trace_prefix: String,
    pub retention_days: u64,
    pub expired_logs_removed: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Replace user text with its length and a content fingerprint.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} sha256/48={}]",
        trimmed.len(),
        text_fingerprint(trimmed)
    )
}

/// First 48 bits of the SHA-256 digest, hex-encoded. Stable across
/// processes and restarts, so fingerprints in different files correlate.
pub fn text_fingerprint(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Mirror a stage event onto the trace stream. Field layout matches the
/// StageEvent record, plus a derived duration for shippers that cannot
/// subtract timestamps.
pub fn emit_stage_event(event: &StageEvent) {
    let duration_ms = event
        .ended_at
        .map(|ended| (ended - event.started_at).num_milliseconds().max(0))
        .unwrap_or(0);
    let error_kind = event.error_kind.as_deref().unwrap_or("");
    let notes = event.notes.as_deref().unwrap_or("");
    let level = match event.phase {
        StagePhase::Error => Level::WARN,
        _ => Level::INFO,
    };
    match level {
        Level::WARN => tracing::warn!(
            target: "cascade.trace",
            session_id = %event.session_id,
            stage = %event.stage,
            phase = event.phase.as_str(),
            seq = event.seq,
            duration_ms,
            cost_micros = event.cost_micros,
            tokens_in = event.tokens_in,
            tokens_out = event.tokens_out,
            cache_hit = event.cache_hit,
            error_kind = error_kind,
            notes = notes,
            "stage_event"
        ),
        _ => tracing::info!(
            target: "cascade.trace",
            session_id = %event.session_id,
            stage = %event.stage,
            phase = event.phase.as_str(),
            seq = event.seq,
            duration_ms,
            cost_micros = event.cost_micros,
            tokens_in = event.tokens_in,
            tokens_out = event.tokens_out,
            cache_hit = event.cache_hit,
            error_kind = error_kind,
            notes = notes,
            "stage_event"
        ),
    }
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(LoggingGuards, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let expired_logs_removed = sweep_expired_logs(logs_dir, retention_days)?;

    let diagnostics_prefix = format!("cascade.{}", process.as_str());
    let trace_prefix = format!("cascade.{}.trace", process.as_str());

    let (diagnostics_writer, diagnostics_guard) =
        tracing_appender::non_blocking(rolling_jsonl(logs_dir, &diagnostics_prefix)?);
    let (trace_writer, trace_guard) =
        tracing_appender::non_blocking(rolling_jsonl(logs_dir, &trace_prefix)?);

    // Stage events land only in the trace file; the diagnostics file
    // carries everything else.
    let trace_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(trace_writer)
        .with_ansi(false)
        .with_target(false)
        .with_current_span(false)
        .with_span_list(false)
        .with_filter(Targets::new().with_target(TRACE_TARGET, Level::INFO));

    let diagnostics_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(diagnostics_writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false)
        .with_filter(
            Targets::new()
                .with_default(LevelFilter::TRACE)
                .with_target(TRACE_TARGET, LevelFilter::OFF),
        );

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(diagnostics_layer)
        .with(trace_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        diagnostics_prefix,
        trace_prefix,
        retention_days,
        expired_logs_removed,
        initialized_at: Utc::now(),
    };
    let guards = LoggingGuards {
        _diagnostics: diagnostics_guard,
        _trace: trace_guard,
    };

    Ok((guards, info))
}

fn rolling_jsonl(dir: &Path, prefix: &str) -> anyhow::Result<RollingFileAppender> {
    Ok(tracing_appender::rolling::Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("jsonl")
        .build(dir)?)
}

/// Delete cascade log files whose last modification is past the retention
/// window. Judged by filesystem mtime, so renamed or hand-rotated files
/// age out too. Returns how many files were removed.
fn sweep_expired_logs(logs_dir: &Path, retention_days: u64) -> anyhow::Result<usize> {
    let Some(cutoff) =
        SystemTime::now().checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
    else {
        return Ok(0);
    };

    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("cascade.") || !name.ends_with(".jsonl") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
