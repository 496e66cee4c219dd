//! Fire-and-forget history recording.
//!
//! The core reports state changes to a [`HistorySink`] without waiting for,
//! or hearing about, the outcome. [`Journal`] is the JSONL reference sink:
//! one [`HistoryEntry`] per line in `history.jsonl`.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const JOURNAL_FILE: &str = "history.jsonl";

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    /// What happened, e.g. `"daemon_closed"`.
    pub kind: String,
    /// What it happened to, e.g. a daemon name.
    pub subject: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(kind: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            subject: subject.into(),
            payload: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Persistence collaborator.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry: &HistoryEntry) -> Result<(), JournalError>;
}

/// Append-only JSONL journal.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    // Serializes appends from detached writers.
    write_lock: Mutex<()>,
}

impl Journal {
    /// Journal at `{dir}/history.jsonl`. The file is created on first write.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(JOURNAL_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry recorded so far, oldest first. Blank lines are skipped.
    pub fn load(&self) -> Result<Vec<HistoryEntry>, JournalError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl HistorySink for Journal {
    fn record(&self, entry: &HistoryEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Record `entry` on a background thread. Failures are logged, never returned.
pub fn record_detached(sink: Arc<dyn HistorySink>, entry: HistoryEntry) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let Err(err) = sink.record(&entry) {
            log::warn!("failed to record {} for {}: {}", entry.kind, entry.subject, err);
        }
    })
}
