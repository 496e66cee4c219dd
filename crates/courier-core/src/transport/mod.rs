//! Line-delimited message channel across a process boundary.
//!
//! Two halves share the [`Transport`] contract:
//! - [`DaemonTransport`] is the controller side. It owns the worker's
//!   [`ProcessGuard`](crate::guard::ProcessGuard), checks liveness before
//!   every read and write, and turns process death or end of output into the
//!   terminal condition.
//! - [`ChildTransport`] is the worker side, speaking on its own stdin/stdout.
//!
//! # Terminal condition
//!
//! [`TransportError::Terminal`] means "this transport will never yield
//! another message". A driving loop must stop and tear down when it sees it;
//! [`drive`] does exactly that.

mod controller;
mod worker;

pub use controller::DaemonTransport;
pub use worker::{ChildTransport, ReadStrategy};

use std::fmt;

use thiserror::Error;

use crate::message::Message;

/// Why a transport went terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The peer process is no longer running.
    ProcessExited,
    /// The input stream reached end of file.
    EndOfStream,
    /// Reading or writing the pipe failed.
    Broken,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Termination::ProcessExited => "process exited",
            Termination::EndOfStream => "end of stream",
            Termination::Broken => "broken pipe",
        };
        f.write_str(reason)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed: {0}")]
    Terminal(Termination),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// True when the transport must be torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Terminal(_))
    }

    pub fn termination(&self) -> Option<Termination> {
        match self {
            TransportError::Terminal(reason) => Some(*reason),
            TransportError::Encode(_) => None,
        }
    }
}

/// One side of a message channel.
///
/// `get` suspends until a full message arrives or the channel is known to be
/// closed. Messages arrive in send order. Malformed lines are skipped and
/// never surface as errors.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn get(&mut self) -> Result<Message, TransportError>;

    async fn put(&mut self, message: &Message) -> Result<(), TransportError>;
}

/// Feed every message from `transport` to `handle` until it goes terminal.
///
/// Returns the reason the loop stopped.
pub async fn drive<T, F>(transport: &mut T, mut handle: F) -> Termination
where
    T: Transport,
    F: FnMut(Message),
{
    loop {
        match transport.get().await {
            Ok(message) => handle(message),
            Err(TransportError::Terminal(reason)) => return reason,
            Err(err) => log::warn!("unexpected transport error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    struct Scripted {
        inbox: VecDeque<Message>,
        sent: Vec<Message>,
    }

    impl Transport for Scripted {
        async fn get(&mut self) -> Result<Message, TransportError> {
            self.inbox
                .pop_front()
                .ok_or(TransportError::Terminal(Termination::EndOfStream))
        }

        async fn put(&mut self, message: &Message) -> Result<(), TransportError> {
            self.sent.push(message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn drive_stops_on_terminal() {
        let mut transport = Scripted {
            inbox: VecDeque::from([json!(1), json!(2), json!(3)]),
            sent: Vec::new(),
        };
        let mut seen = Vec::new();
        let reason = drive(&mut transport, |m| seen.push(m)).await;
        assert_eq!(reason, Termination::EndOfStream);
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);
        transport.put(&json!("bye")).await.unwrap();
        assert_eq!(transport.sent, vec![json!("bye")]);
    }

    #[test]
    fn terminal_classification() {
        let terminal = TransportError::Terminal(Termination::ProcessExited);
        assert!(terminal.is_terminal());
        assert_eq!(terminal.termination(), Some(Termination::ProcessExited));
        assert_eq!(terminal.to_string(), "transport closed: process exited");

        let encode: TransportError = serde_json::from_str::<Message>("{")
            .map(|_| ())
            .unwrap_err()
            .into();
        assert!(!encode.is_terminal());
    }
}
