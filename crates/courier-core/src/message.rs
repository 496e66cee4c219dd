//! Line protocol shared by both sides of a transport.
//!
//! Every message is one JSON value serialized on a single line and
//! terminated by `\n`. JSON escapes embedded newlines, so a message can never
//! span two lines. Lines that fail to decode are dropped by the reader.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// A structurally typed message: object, array, string (or any other JSON
/// value). The transport never interprets it.
pub type Message = Value;

/// Encode a message as one newline-terminated line.
pub fn encode_line<T: Serialize + ?Sized>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line, returning `None` for blank or malformed input.
///
/// Invalid UTF-8 is decoded lossily first, so a line of binary noise is
/// rejected by the JSON parser rather than by the reader.
pub fn decode_line(line: &[u8]) -> Option<Message> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(err) => {
            log::debug!("discarding malformed line ({err}): {text}");
            None
        }
    }
}

/// Split the first complete line (without its `\n`) off the front of `buf`.
pub(crate) fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    Some(line)
}

#[derive(Error, Debug)]
pub enum DaemonArgsError {
    #[error("daemon kind '{0}' not found in arguments")]
    MissingKind(String),

    #[error("missing {0} after daemon kind")]
    MissingValue(&'static str),

    #[error("invalid daemon {field}: {source}")]
    Invalid {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("daemon {0} has the wrong JSON shape")]
    WrongShape(&'static str),
}

/// Launch arguments of a worker daemon.
///
/// Encoded on the worker's command line as
/// `<kind> <json array of args> <json object of kwargs>`.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonArgs {
    pub kind: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl DaemonArgs {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Command-line arguments for the worker.
    pub fn to_argv(&self) -> Vec<String> {
        vec![
            self.kind.clone(),
            Value::Array(self.args.clone()).to_string(),
            Value::Object(self.kwargs.clone()).to_string(),
        ]
    }

    /// Find `kind` in `argv` and decode the two values that follow it.
    pub fn from_argv<S: AsRef<str>>(argv: &[S], kind: &str) -> Result<Self, DaemonArgsError> {
        let index = argv
            .iter()
            .position(|arg| arg.as_ref() == kind)
            .ok_or_else(|| DaemonArgsError::MissingKind(kind.to_string()))?;

        let raw_args = argv
            .get(index + 1)
            .ok_or(DaemonArgsError::MissingValue("args"))?;
        let raw_kwargs = argv
            .get(index + 2)
            .ok_or(DaemonArgsError::MissingValue("kwargs"))?;

        let args = match parse_field("args", raw_args.as_ref())? {
            Value::Array(values) => values,
            _ => return Err(DaemonArgsError::WrongShape("args")),
        };
        let kwargs = match parse_field("kwargs", raw_kwargs.as_ref())? {
            Value::Object(map) => map,
            _ => return Err(DaemonArgsError::WrongShape("kwargs")),
        };

        Ok(Self {
            kind: kind.to_string(),
            args,
            kwargs,
        })
    }
}

fn parse_field(field: &'static str, raw: &str) -> Result<Value, DaemonArgsError> {
    serde_json::from_str(raw).map_err(|source| DaemonArgsError::Invalid { field, source })
}
