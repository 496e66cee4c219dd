//! Per-daemon transcript files.
//!
//! Every line crossing a controller transport can be appended to a transcript
//! with a direction tag (`STDIN`, `STDOUT`, `STDERR`). Diagnostics proper go
//! through the `log` facade; transcripts are the raw wire record.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

/// Thread-safe handle to an append-only transcript file.
///
/// `None` inside means transcripts are disabled and writes are no-ops.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// A handle that records nothing.
pub fn disabled_log() -> LogHandle {
    Arc::new(Mutex::new(None))
}

/// Current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Append a timestamped line to the transcript (if enabled).
pub fn log_line(handle: &LogHandle, direction: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let _ = writeln!(file, "[{}] {}: {}", utc_timestamp(), direction, data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) `{log_dir}/{log_id}.log` and return a shared handle.
///
/// Any failure yields a disabled handle; transcripts never stop a daemon
/// from starting.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        if let Err(err) = std::fs::create_dir_all(dir) {
            log::warn!("cannot create transcript dir {}: {}", dir.display(), err);
            return None;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{log_id}.log")))
            .map_err(|err| log::warn!("cannot open transcript for {log_id}: {err}"))
            .ok()
    });
    Arc::new(Mutex::new(file))
}
