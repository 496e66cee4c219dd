//! Settings persistence and the display-format provider.
//!
//! Stored as `settings.json` in the config directory:
//!
//! ```json
//! {
//!   "timestamp_format": "%d/%m/%Y %H:%M",
//!   "datestamp_format": "%d/%m/%Y",
//!   "worker_stop_grace_ms": 3000,
//!   "log_dir": null
//! }
//! ```
//!
//! Missing fields take their defaults, so older files keep loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timestamp::{FormatProvider, StampKind, TimestampRegistry};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// strftime format for full timestamps.
    pub timestamp_format: String,
    /// strftime format for date-only stamps.
    pub datestamp_format: String,
    /// How long a stopping worker gets before it is killed.
    pub worker_stop_grace_ms: u64,
    /// Where daemon transcripts go; `None` disables them.
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timestamp_format: "%d/%m/%Y %H:%M".to_string(),
            datestamp_format: "%d/%m/%Y".to_string(),
            worker_stop_grace_ms: 3000,
            log_dir: None,
        }
    }
}

impl Settings {
    pub fn worker_stop_grace(&self) -> Duration {
        Duration::from_millis(self.worker_stop_grace_ms)
    }

    pub fn format_for(&self, kind: StampKind) -> &str {
        match kind {
            StampKind::Timestamp => &self.timestamp_format,
            StampKind::Datestamp => &self.datestamp_format,
        }
    }

    fn format_for_mut(&mut self, kind: StampKind) -> &mut String {
        match kind {
            StampKind::Timestamp => &mut self.timestamp_format,
            StampKind::Datestamp => &mut self.datestamp_format,
        }
    }
}

/// Save settings to `{dir}/settings.json` (write-then-rename).
pub fn save_settings(dir: &Path, settings: &Settings) -> Result<(), SettingsError> {
    fs::create_dir_all(dir)?;

    let file_path = dir.join(SETTINGS_FILE);
    let temp_path = dir.join(format!("{SETTINGS_FILE}.tmp"));

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, &file_path)?;

    Ok(())
}

/// Load settings from `{dir}/settings.json`; defaults when the file is missing.
pub fn load_settings(dir: &Path) -> Result<Settings, SettingsError> {
    let file_path = dir.join(SETTINGS_FILE);
    if !file_path.exists() {
        return Ok(Settings::default());
    }
    let contents = fs::read_to_string(&file_path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Shared, mutable settings. Readers look formats up by key on every
/// render, so changes apply without touching the timestamps themselves.
#[derive(Debug, Default)]
pub struct SettingsStore {
    settings: RwLock<Settings>,
    dir: Option<PathBuf>,
}

impl SettingsStore {
    /// In-memory store; [`SettingsStore::save`] is a no-op.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            dir: None,
        }
    }

    /// Store backed by `{dir}/settings.json`.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let dir = dir.into();
        let settings = load_settings(&dir)?;
        Ok(Self {
            settings: RwLock::new(settings),
            dir: Some(dir),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn snapshot(&self) -> Settings {
        self.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut settings);
    }

    /// Change a display format and invalidate every live stamp of that kind.
    ///
    /// Returns how many cached displays were cleared.
    pub fn set_format(
        &self,
        kind: StampKind,
        format: impl Into<String>,
        registry: &TimestampRegistry,
    ) -> usize {
        let format = format.into();
        log::info!("{} changed to {:?}", kind.format_key(), format);
        self.update(|settings| *settings.format_for_mut(kind) = format);
        registry.invalidate(kind)
    }

    /// Persist the current settings, if the store has a directory.
    pub fn save(&self) -> Result<(), SettingsError> {
        match &self.dir {
            Some(dir) => save_settings(dir, &self.read()),
            None => Ok(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FormatProvider for SettingsStore {
    fn format(&self, key: &str) -> Option<String> {
        StampKind::ALL
            .into_iter()
            .find(|kind| kind.format_key() == key)
            .map(|kind| self.read().format_for(kind).to_string())
    }
}
