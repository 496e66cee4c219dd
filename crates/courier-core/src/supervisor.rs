//! Named daemon supervision.
//!
//! Each daemon is driven by one task on the runtime that exclusively owns its
//! [`DaemonTransport`]. The task forwards inbound messages to a per-daemon
//! event queue and writes queued outbound messages to the worker. When the
//! transport goes terminal, or a stop is requested, the task shuts the
//! worker down and reports [`DaemonEvent::Closed`].
//!
//! The UI loop drains events with [`DaemonManager::poll`], which never blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::guard::ProcessExit;
use crate::journal::{record_detached, HistoryEntry, HistorySink};
use crate::message::Message;
use crate::spawn::{SpawnError, WorkerCommand};
use crate::transport::DaemonTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    Message(Message),
    /// The daemon is gone; carries its exit status when one was observed.
    Closed(Option<ProcessExit>),
}

struct DaemonEntry {
    /// `None` once a stop was requested.
    outbox: Option<UnboundedSender<Message>>,
    events: UnboundedReceiver<DaemonEvent>,
    task: JoinHandle<()>,
}

pub struct DaemonManager {
    runtime: Handle,
    grace: Duration,
    history: Option<Arc<dyn HistorySink>>,
    daemons: Mutex<HashMap<String, DaemonEntry>>,
}

impl DaemonManager {
    /// Manager spawning its driving tasks on `runtime`. Stopping workers get
    /// `grace` to exit before they are killed.
    pub fn new(runtime: Handle, grace: Duration) -> Self {
        Self {
            runtime,
            grace,
            history: None,
            daemons: Mutex::new(HashMap::new()),
        }
    }

    /// Report daemon starts and exits to `sink`.
    pub fn with_history(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    /// Spawn a worker under `name` and start driving it.
    ///
    /// A daemon already running under the same name is stopped first.
    pub fn start(&self, name: &str, command: &WorkerCommand) -> Result<(), SpawnError> {
        if self.stop(name) {
            log::info!("replacing daemon {}", name);
        }

        let transport = {
            let _runtime = self.runtime.enter();
            command.spawn(name)?
        };

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = self.runtime.spawn(drive_daemon(
            name.to_string(),
            transport,
            outbox_rx,
            events_tx,
            self.grace,
        ));

        self.lock().insert(
            name.to_string(),
            DaemonEntry {
                outbox: Some(outbox_tx),
                events: events_rx,
                task,
            },
        );
        self.record(HistoryEntry::new("daemon_started", name));
        Ok(())
    }

    /// Queue a message for the named daemon. False if it is not running.
    pub fn send(&self, name: &str, message: Message) -> bool {
        let daemons = self.lock();
        match daemons.get(name).and_then(|entry| entry.outbox.as_ref()) {
            Some(outbox) => outbox.send(message).is_ok(),
            None => false,
        }
    }

    /// Ask the named daemon to shut down. Its `Closed` event still arrives
    /// through [`DaemonManager::poll`]. False if it was not running.
    pub fn stop(&self, name: &str) -> bool {
        let mut daemons = self.lock();
        match daemons.get_mut(name) {
            Some(entry) => entry.outbox.take().is_some(),
            None => false,
        }
    }

    /// Stop every daemon and forget them all.
    ///
    /// Returns the driving tasks; await them to wait for the teardown.
    pub fn stop_all(&self) -> Vec<JoinHandle<()>> {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            log::info!("stopping {} daemon(s)", drained.len());
        }
        drained.into_iter().map(|(_, entry)| entry.task).collect()
    }

    /// Drain pending events of every daemon without blocking.
    ///
    /// Events of one daemon come out in the order they happened. Daemons
    /// that closed are forgotten after their `Closed` event is returned.
    pub fn poll(&self) -> Vec<(String, DaemonEvent)> {
        let mut drained = Vec::new();
        let mut finished = Vec::new();
        {
            let mut daemons = self.lock();
            for (name, entry) in daemons.iter_mut() {
                loop {
                    match entry.events.try_recv() {
                        Ok(event) => {
                            let closed = matches!(event, DaemonEvent::Closed(_));
                            drained.push((name.clone(), event));
                            if closed {
                                finished.push(name.clone());
                                break;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            log::warn!("daemon {} driver ended without closing", name);
                            drained.push((name.clone(), DaemonEvent::Closed(None)));
                            finished.push(name.clone());
                            break;
                        }
                    }
                }
            }
            for name in &finished {
                daemons.remove(name);
            }
        }

        for (name, event) in &drained {
            if let DaemonEvent::Closed(exit) = event {
                self.record(
                    HistoryEntry::new("daemon_closed", name.as_str())
                        .with_payload(serde_json::json!({ "exit": exit })),
                );
            }
        }
        drained
    }

    /// True while the daemon is known and no stop was requested.
    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .map_or(false, |entry| entry.outbox.is_some() && !entry.task.is_finished())
    }

    pub fn list_running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.outbox.is_some() && !entry.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn record(&self, entry: HistoryEntry) {
        if let Some(sink) = &self.history {
            record_detached(Arc::clone(sink), entry);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DaemonEntry>> {
        self.daemons.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn drive_daemon(
    name: String,
    mut transport: DaemonTransport,
    mut outbox: UnboundedReceiver<Message>,
    events: UnboundedSender<DaemonEvent>,
    grace: Duration,
) {
    loop {
        tokio::select! {
            received = transport.get() => match received {
                Ok(message) => {
                    log::debug!("daemon {} -> {}", name, message);
                    if events.send(DaemonEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Err(err) if err.is_terminal() => {
                    log::info!("daemon {}: {}", name, err);
                    break;
                }
                Err(err) => log::warn!("daemon {}: {}", name, err),
            },
            outgoing = outbox.recv() => match outgoing {
                Some(message) => match transport.put(&message).await {
                    Ok(()) => {}
                    Err(err) if err.is_terminal() => {
                        log::info!("daemon {}: {}", name, err);
                        break;
                    }
                    Err(err) => log::warn!("daemon {}: dropped outgoing message: {}", name, err),
                },
                None => {
                    log::debug!("daemon {}: stop requested", name);
                    break;
                }
            },
        }
    }

    let exit = transport.shutdown(grace).await;
    let _ = events.send(DaemonEvent::Closed(exit));
}
