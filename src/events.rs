//! Append-only audit log of repair runs.
//!
//! One JSON line per completed attempt and one per terminal session, plus a
//! record at the start and end of each run. Every record carries the run id.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::model::{RepairAttempt, RepairSession, RunReport, SessionStatus};

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was accepted and is about to fan out.
    RunStarted {
        /// Run id shared by every record of the run.
        run_id: String,
        /// When the record was produced.
        timestamp: DateTime<Utc>,
        /// Unit paths, in submission order.
        units: Vec<String>,
        /// Execution budget per unit.
        max_fix_attempts: u32,
        /// Effective concurrency limit.
        concurrency: usize,
        /// Oracle backend name.
        oracle: String,
    },
    /// One repair attempt completed.
    Attempt {
        /// Run id shared by every record of the run.
        run_id: String,
        /// When the record was produced.
        timestamp: DateTime<Utc>,
        /// Unit the attempt belongs to.
        path: String,
        /// The attempt as recorded on the session.
        attempt: RepairAttempt,
    },
    /// A session reached a terminal status.
    Session {
        /// Run id shared by every record of the run.
        run_id: String,
        /// When the record was produced.
        timestamp: DateTime<Utc>,
        /// Unit path.
        path: String,
        /// Terminal status.
        status: SessionStatus,
        /// Executions performed.
        attempts: usize,
        /// Revisions the oracle supplied.
        fixes_applied: usize,
        /// Reason for a system error or cancellation.
        detail: Option<String>,
        /// Wall time of the session.
        duration_ms: f64,
    },
    /// Every session of the run is terminal.
    RunFinished {
        /// Run id shared by every record of the run.
        run_id: String,
        /// When the record was produced.
        timestamp: DateTime<Utc>,
        /// True when every session succeeded.
        overall_success: bool,
        /// Sessions that ended in `Succeeded`.
        succeeded: usize,
        /// Sessions in the run.
        total: usize,
        /// Wall time of the run.
        total_duration_ms: f64,
    },
}

impl RunEvent {
    /// Record for a completed attempt.
    pub fn attempt(run_id: &str, path: &str, attempt: &RepairAttempt) -> Self {
        Self::Attempt {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            path: path.to_string(),
            attempt: attempt.clone(),
        }
    }

    /// Record for a terminal session.
    pub fn session(run_id: &str, session: &RepairSession) -> Self {
        Self::Session {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            path: session.path.clone(),
            status: session.status,
            attempts: session.attempts.len(),
            fixes_applied: session.fixes_applied(),
            detail: session.detail.clone(),
            duration_ms: session.duration_ms,
        }
    }

    /// Closing record built from the final report.
    pub fn run_finished(report: &RunReport) -> Self {
        Self::RunFinished {
            run_id: report.run_id.clone(),
            timestamp: Utc::now(),
            overall_success: report.overall_success,
            succeeded: report.count(SessionStatus::Succeeded),
            total: report.sessions.len(),
            total_duration_ms: report.total_duration_ms,
        }
    }

    /// Run this record belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::Attempt { run_id, .. }
            | Self::Session { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    /// When the record was produced.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::Attempt { timestamp, .. }
            | Self::Session { timestamp, .. }
            | Self::RunFinished { timestamp, .. } => *timestamp,
        }
    }
}

/// Destination for audit records. Shared by every session of a run.
pub trait EventSink: Send + Sync {
    /// Appends one record. Implementations serialize concurrent writers.
    fn append(&self, event: &RunEvent) -> Result<()>;
}

/// JSON-lines file sink. A single buffered writer behind a mutex, flushed per record.
pub struct JsonlEventLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventLog {
    /// Opens (or creates) the log in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventLog {
    fn append(&self, event: &RunEvent) -> Result<()> {
        let row = serde_json::to_string(event).context("Failed to serialize event")?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("event log writer poisoned"))?;
        writeln!(writer, "{row}")
            .and_then(|()| writer.flush())
            .with_context(|| format!("Failed to write event log: {}", self.path.display()))
    }
}

/// Keeps records in memory. Used by embedders and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record appended so far.
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn append(&self, event: &RunEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn append(&self, _event: &RunEvent) -> Result<()> {
        Ok(())
    }
}

/// Reads every record of a log. Missing files read as empty; malformed lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<RunEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read event log: {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping malformed event on line {}: {}", index + 1, e),
        }
    }
    Ok(events)
}
