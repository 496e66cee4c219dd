//! # courier-core
//!
//! Coordination layer between a single-threaded UI loop, background worker
//! threads and spawned daemon subprocesses.
//!
//! This crate is framework-agnostic: the UI supplies render steps and drives
//! the per-tick poll, everything else lives here.
//!
//! ## Key Concepts
//!
//! - **Transport**: line-delimited JSON channel across a process boundary
//!   ([`DaemonTransport`] on the controller side, [`ChildTransport`] in the worker)
//! - **ProcessGuard**: kills a spawned process exactly once, on every exit path
//! - **PopupQueue**: confirmation requests from any thread, rendered on the UI thread
//! - **ScopedCounter**: "am I already inside this?" depth tracking
//! - **CachedTimestamp**: lazily formatted timestamps with broadcast invalidation

pub mod context;
pub mod counter;
pub mod guard;
pub mod journal;
pub mod logging;
pub mod message;
pub mod paths;
pub mod popup;
pub mod settings;
pub mod spawn;
pub mod supervisor;
pub mod timestamp;
pub mod transport;

// Re-export commonly used types
pub use context::CourierContext;
pub use counter::ScopedCounter;
pub use guard::{ProcessExit, ProcessGuard};
pub use message::{DaemonArgs, Message};
pub use popup::{PopupQueue, PopupRequest, RenderOutcome};
pub use spawn::{spawn_daemon, WorkerCommand};
pub use supervisor::{DaemonEvent, DaemonManager};
pub use timestamp::{CachedTimestamp, StampKind, TimestampRegistry};
pub use transport::{ChildTransport, DaemonTransport, Transport, TransportError};
