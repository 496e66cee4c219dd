//! CourierContext - process-scoped state shared by the UI loop and workers.
//!
//! Holds the pieces that would otherwise be global registries: the popup
//! queue, the daemon manager, the timestamp registry and the settings store.
//! The context is empty when built and emptied again by
//! [`CourierContext::shutdown`].
//!
//! ```text
//!     worker threads ──push──▶ PopupQueue ──┐
//!                                           ├──▶ tick() on the UI thread
//!     DaemonManager tasks ──events──────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;

use crate::journal::{record_detached, HistoryEntry, Journal};
use crate::popup::{PopupQueue, RenderOutcome};
use crate::settings::SettingsStore;
use crate::spawn::{SpawnError, WorkerCommand};
use crate::supervisor::{DaemonEvent, DaemonManager};
use crate::timestamp::{StampKind, TimestampRegistry};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("no tokio runtime available for daemons: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Configuration for building a CourierContext.
#[derive(Default)]
pub struct CourierContextBuilder {
    runtime: Option<Handle>,
    config_dir: Option<PathBuf>,
    settings: Option<Arc<SettingsStore>>,
    journal: Option<Arc<Journal>>,
}

impl CourierContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime that drives daemons. Defaults to the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Load settings from, and keep the journal in, this directory.
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Use an existing SettingsStore (for testing or custom configurations).
    pub fn settings(mut self, store: Arc<SettingsStore>) -> Self {
        self.settings = Some(store);
        self
    }

    /// Use an existing Journal (for testing or custom configurations).
    pub fn journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn build(self) -> Result<CourierContext, ContextError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };

        let settings = self.settings.unwrap_or_else(|| {
            let store = match &self.config_dir {
                Some(dir) => SettingsStore::load(dir.clone()).unwrap_or_else(|err| {
                    log::warn!("using default settings: {}", err);
                    SettingsStore::default()
                }),
                None => SettingsStore::default(),
            };
            Arc::new(store)
        });
        let journal = self
            .journal
            .or_else(|| self.config_dir.as_ref().map(|dir| Arc::new(Journal::new(dir))));

        let mut daemons = DaemonManager::new(runtime, settings.snapshot().worker_stop_grace());
        if let Some(journal) = &journal {
            daemons = daemons.with_history(journal.clone());
        }

        Ok(CourierContext {
            popups: Arc::new(PopupQueue::new()),
            daemons: Arc::new(daemons),
            timestamps: Arc::new(TimestampRegistry::new(settings.clone())),
            settings,
            journal,
        })
    }
}

/// What one UI tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Outcome of rendering the popup head, if there was one.
    pub popup: Option<RenderOutcome>,
    /// Daemon events drained this tick.
    pub events: Vec<(String, DaemonEvent)>,
}

/// Shared state for the UI loop, worker threads and daemon supervision.
///
/// Cloning is cheap: every field is an `Arc`.
#[derive(Clone)]
pub struct CourierContext {
    pub popups: Arc<PopupQueue>,
    pub daemons: Arc<DaemonManager>,
    pub timestamps: Arc<TimestampRegistry>,
    pub settings: Arc<SettingsStore>,
    pub journal: Option<Arc<Journal>>,
}

impl CourierContext {
    pub fn builder() -> CourierContextBuilder {
        CourierContextBuilder::new()
    }

    /// Start a daemon, recording its transcript under the configured log dir
    /// unless the command already names one.
    pub fn start_daemon(&self, name: &str, command: &WorkerCommand) -> Result<(), SpawnError> {
        match (command.get_transcript_dir(), self.settings.snapshot().log_dir) {
            (None, Some(log_dir)) => self
                .daemons
                .start(name, &command.clone().transcript_dir(log_dir)),
            _ => self.daemons.start(name, command),
        }
    }

    /// One UI tick: render the popup head, then drain daemon events.
    pub fn tick(&self) -> TickReport {
        TickReport {
            popup: self.popups.tick(),
            events: self.daemons.poll(),
        }
    }

    /// Change a display format, invalidate matching stamps and persist.
    pub fn set_format(&self, kind: StampKind, format: &str) -> usize {
        let cleared = self.settings.set_format(kind, format, &self.timestamps);
        if let Err(err) = self.settings.save() {
            log::warn!("failed to save settings: {}", err);
        }
        if let Some(journal) = &self.journal {
            record_detached(
                journal.clone(),
                HistoryEntry::new("format_changed", kind.format_key())
                    .with_payload(serde_json::json!({ "format": format })),
            );
        }
        cleared
    }

    /// Stop every daemon, drop pending popups and clear the timestamp
    /// registries. Await the returned tasks to wait for daemon teardown.
    pub fn shutdown(&self) -> Vec<JoinHandle<()>> {
        log::info!("shutting down courier context");
        let tasks = self.daemons.stop_all();
        self.popups.clear();
        self.timestamps.clear();
        tasks
    }
}
