//! Worker process spawning.
//!
//! [`WorkerCommand`] describes how to launch a worker; [`WorkerCommand::spawn`]
//! starts it with piped stdio and hands back the controller end of the
//! transport, which owns the only guard for the child.
//!
//! Spawning must happen inside a tokio runtime.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

use crate::logging::open_log_file;
use crate::message::DaemonArgs;
use crate::transport::DaemonTransport;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("worker {0} was not piped")]
    MissingPipe(&'static str),

    #[error("cannot locate current executable: {0}")]
    CurrentExe(#[source] io::Error),
}

/// Launch description for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    transcript_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            transcript_dir: None,
        }
    }

    /// Launch `program` as a daemon of the given kind:
    /// `<program> <kind> <json args> <json kwargs>`.
    pub fn daemon(program: impl Into<PathBuf>, daemon: &DaemonArgs) -> Self {
        Self::new(program).args(daemon.to_argv())
    }

    /// Launch this executable again as a daemon of the given kind.
    pub fn current_exe(daemon: &DaemonArgs) -> Result<Self, SpawnError> {
        let exe = std::env::current_exe().map_err(SpawnError::CurrentExe)?;
        Ok(Self::daemon(exe, daemon))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Record the wire traffic in `{dir}/{name}.log`.
    pub fn transcript_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.transcript_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_transcript_dir(&self) -> Option<&Path> {
        self.transcript_dir.as_deref()
    }

    /// Start the worker and return the controller transport for it.
    pub fn spawn(&self, name: &str) -> Result<DaemonTransport, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The transport's guard decides when the child dies.
            .kill_on_drop(false);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        log::debug!(
            "spawning daemon {}: {} {:?}",
            name,
            self.program.display(),
            self.args
        );
        let child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let transcript = open_log_file(self.transcript_dir.as_deref(), name);
        DaemonTransport::new(name, child, transcript)
    }
}

/// Spawn `command` under `name`. Shorthand for [`WorkerCommand::spawn`].
pub fn spawn_daemon(command: &WorkerCommand, name: &str) -> Result<DaemonTransport, SpawnError> {
    command.spawn(name)
}
