//! Controller side of a transport: talks to a spawned worker process.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use super::{Termination, Transport, TransportError};
use crate::guard::{ProcessExit, ProcessGuard};
use crate::logging::{log_line, LogHandle};
use crate::message::{decode_line, encode_line, take_line, Message};
use crate::spawn::SpawnError;

const READ_CHUNK: usize = 4096;

/// How long to wait for the exit status after a hard kill.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Controller end of a worker pipe.
///
/// Owns the only [`ProcessGuard`] for the worker; the process is killed when
/// the transport is shut down, killed, or dropped.
pub struct DaemonTransport {
    name: String,
    guard: ProcessGuard<Child>,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    pending: Vec<u8>,
    stdout_closed: bool,
    exit: Option<ProcessExit>,
    transcript: LogHandle,
}

impl DaemonTransport {
    /// Wrap a child spawned with piped stdin and stdout.
    ///
    /// A piped stderr is forwarded line by line to the log and transcript,
    /// which requires a tokio runtime context.
    pub fn new(
        name: impl Into<String>,
        child: Child,
        transcript: LogHandle,
    ) -> Result<Self, SpawnError> {
        let name = name.into();
        // Guard first so a missing pipe still kills the child.
        let mut guard = ProcessGuard::new(child);
        let child = guard.process_mut();
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.clone(), stderr, transcript.clone()));
        }

        log::info!("daemon {} started (pid {:?})", name, guard.pid());

        Ok(Self {
            name,
            guard,
            stdin: Some(stdin),
            stdout,
            pending: Vec::new(),
            stdout_closed: false,
            exit: None,
            transcript,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.guard.pid()
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit
    }

    /// Whether the worker is still running. Records the exit status when it
    /// is not.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() || self.guard.is_released() {
            return false;
        }
        match self.guard.process_mut().try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit = Some(status.into());
                false
            }
            Err(err) => {
                log::debug!("daemon {}: liveness probe failed: {}", self.name, err);
                false
            }
        }
    }

    /// Next message from the worker.
    ///
    /// Malformed lines are skipped. Fails with the terminal condition once
    /// the worker has exited or its stdout reached end of file, checked
    /// before every read from the pipe. Cancel-safe:
    /// partial lines stay buffered for the next call.
    pub async fn get(&mut self) -> Result<Message, TransportError> {
        loop {
            // Complete lines already read are delivered even after exit.
            if let Some(line) = take_line(&mut self.pending) {
                log_line(
                    &self.transcript,
                    "STDOUT",
                    &String::from_utf8_lossy(&line),
                );
                match decode_line(&line) {
                    Some(message) => return Ok(message),
                    None => continue,
                }
            }
            if !self.is_alive() {
                return Err(TransportError::Terminal(Termination::ProcessExited));
            }
            if self.stdout_closed {
                return Err(TransportError::Terminal(Termination::EndOfStream));
            }

            self.pending.reserve(READ_CHUNK);
            let child = self.guard.process_mut();
            let event = tokio::select! {
                biased;
                read = self.stdout.read_buf(&mut self.pending) => ReadEvent::Read(read),
                status = child.wait() => ReadEvent::Exited(status),
            };

            match event {
                ReadEvent::Read(Ok(0)) => self.stdout_closed = true,
                ReadEvent::Read(Ok(_)) => {}
                ReadEvent::Read(Err(err)) => {
                    log::warn!("daemon {}: stdout read failed: {}", self.name, err);
                    return Err(TransportError::Terminal(Termination::Broken));
                }
                ReadEvent::Exited(status) => {
                    match status {
                        Ok(status) => self.exit = Some(status.into()),
                        Err(err) => log::debug!("daemon {}: wait failed: {}", self.name, err),
                    }
                    return Err(TransportError::Terminal(Termination::ProcessExited));
                }
            }
        }
    }

    /// Send one message to the worker, flushed immediately.
    pub async fn put<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Terminal(Termination::ProcessExited));
        }
        let line = encode_line(message)?;
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(TransportError::Terminal(Termination::Broken));
        };

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            log::warn!("daemon {}: stdin write failed: {}", self.name, err);
            self.stdin = None;
            return Err(TransportError::Terminal(Termination::Broken));
        }

        log_line(&self.transcript, "STDIN", line.trim_end());
        Ok(())
    }

    /// Kill the worker now. Idempotent.
    pub fn kill(&mut self) {
        self.guard.kill();
    }

    /// Stop the worker: close its stdin, interrupt it, give it `grace` to
    /// exit, then kill it. Returns the exit status if one was observed.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ProcessExit> {
        self.stdin = None;
        if self.is_alive() {
            self.guard.interrupt();
            match tokio::time::timeout(grace, self.guard.process_mut().wait()).await {
                Ok(Ok(status)) => self.exit = Some(status.into()),
                Ok(Err(err)) => log::debug!("daemon {}: wait failed: {}", self.name, err),
                Err(_) => log::info!(
                    "daemon {} still running after {:?}; killing",
                    self.name,
                    grace
                ),
            }
        }
        self.guard.kill();
        if self.exit.is_none() {
            if let Ok(Ok(status)) =
                tokio::time::timeout(REAP_TIMEOUT, self.guard.process_mut().wait()).await
            {
                self.exit = Some(status.into());
            }
        }
        log::info!("daemon {} stopped ({:?})", self.name, self.exit);
        self.exit
    }
}

enum ReadEvent {
    Read(std::io::Result<usize>),
    Exited(std::io::Result<std::process::ExitStatus>),
}

impl Transport for DaemonTransport {
    async fn get(&mut self) -> Result<Message, TransportError> {
        DaemonTransport::get(self).await
    }

    async fn put(&mut self, message: &Message) -> Result<(), TransportError> {
        DaemonTransport::put(self, message).await
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr, transcript: LogHandle) {
    let mut lines = BufReader::new(stderr).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(line)) => {
                let line = String::from_utf8_lossy(&line);
                log::warn!("daemon stderr [{}]: {}", name, line.trim_end());
                log_line(&transcript, "STDERR", line.trim_end());
            }
            Ok(None) => break,
            Err(err) => {
                log::debug!("daemon {}: stderr read failed: {}", name, err);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::spawn::WorkerCommand;
    use serde_json::json;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn(program: &str, args: &[&str]) -> DaemonTransport {
        WorkerCommand::new(program)
            .args(args.iter().copied())
            .spawn("test")
            .unwrap()
    }

    async fn wait_for_exit(transport: &mut DaemonTransport) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while transport.is_alive() {
            assert!(tokio::time::Instant::now() < deadline, "process never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    mod exchange {
        use super::*;

        #[tokio::test]
        async fn ping_is_echoed_back() {
            let mut transport = spawn("cat", &[]);
            transport.put(&json!({"cmd": "ping"})).await.unwrap();
            let reply = tokio::time::timeout(WAIT, transport.get()).await.unwrap();
            assert_eq!(reply.unwrap(), json!({"cmd": "ping"}));
        }

        #[tokio::test]
        async fn messages_arrive_in_send_order() {
            let mut transport = spawn("cat", &[]);
            for n in 0..20 {
                transport.put(&json!({"n": n})).await.unwrap();
            }
            for n in 0..20 {
                let message = tokio::time::timeout(WAIT, transport.get())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(message, json!({"n": n}));
            }
        }

        #[tokio::test]
        async fn malformed_lines_are_skipped() {
            let mut transport = spawn(
                "sh",
                &[
                    "-c",
                    r#"printf '%s\n' '{"n":1}' 'warning: noise' '[2]' '' '"three"'; exec sleep 30"#,
                ],
            );
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(
                    tokio::time::timeout(WAIT, transport.get())
                        .await
                        .unwrap()
                        .unwrap(),
                );
            }
            assert_eq!(seen, vec![json!({"n": 1}), json!([2]), json!("three")]);
        }

        #[tokio::test]
        async fn get_is_cancel_safe() {
            let mut transport = spawn("cat", &[]);
            // Nothing to read yet: the first get times out mid-read.
            let timed_out = tokio::time::timeout(Duration::from_millis(50), transport.get()).await;
            assert!(timed_out.is_err());
            transport.put(&json!("late")).await.unwrap();
            let message = tokio::time::timeout(WAIT, transport.get()).await.unwrap();
            assert_eq!(message.unwrap(), json!("late"));
        }
    }

    mod terminal {
        use super::*;

        #[tokio::test]
        async fn get_after_exit_is_terminal() {
            let mut transport = spawn("true", &[]);
            wait_for_exit(&mut transport).await;
            let err = transport.get().await.unwrap_err();
            assert_eq!(err.termination(), Some(Termination::ProcessExited));
            assert_eq!(transport.exit_status().and_then(|e| e.code), Some(0));
        }

        #[tokio::test]
        async fn put_after_exit_is_terminal() {
            let mut transport = spawn("true", &[]);
            wait_for_exit(&mut transport).await;
            let err = transport.put(&json!({"cmd": "ping"})).await.unwrap_err();
            assert!(err.is_terminal());
        }

        #[tokio::test]
        async fn external_kill_mid_read_is_terminal() {
            let mut transport = spawn("sleep", &["30"]);
            let pid = transport.pid().unwrap() as libc::pid_t;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                // SAFETY: signalling a child we spawned.
                unsafe { libc::kill(pid, libc::SIGKILL) };
            });
            let result = tokio::time::timeout(WAIT, transport.get())
                .await
                .expect("get hung after the worker was killed");
            assert!(result.unwrap_err().is_terminal());
        }

        #[tokio::test]
        async fn closed_stdout_is_terminal() {
            let mut transport = spawn("sh", &["-c", "exec 1>&-; exec sleep 30"]);
            let result = tokio::time::timeout(WAIT, transport.get()).await.unwrap();
            assert_eq!(
                result.unwrap_err().termination(),
                Some(Termination::EndOfStream)
            );
        }

        #[tokio::test]
        async fn kill_makes_transport_terminal() {
            let mut transport = spawn("cat", &[]);
            transport.kill();
            transport.kill();
            assert!(!transport.is_alive());
            assert!(transport.get().await.unwrap_err().is_terminal());
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test]
        async fn worker_exits_on_closed_stdin() {
            let transport = spawn("cat", &[]);
            let exit = transport.shutdown(WAIT).await;
            assert!(exit.is_some());
        }

        #[tokio::test]
        async fn stubborn_worker_is_interrupted() {
            let transport = spawn("sleep", &["30"]);
            let exit = transport.shutdown(WAIT).await.unwrap();
            assert_eq!(exit.signal, Some(libc::SIGTERM));
        }

        #[tokio::test]
        async fn transcript_records_both_directions() {
            let dir = tempdir().unwrap();
            let mut transport = WorkerCommand::new("cat")
                .transcript_dir(dir.path())
                .spawn("echo")
                .unwrap();
            transport.put(&json!({"cmd": "ping"})).await.unwrap();
            tokio::time::timeout(WAIT, transport.get())
                .await
                .unwrap()
                .unwrap();
            transport.shutdown(WAIT).await;

            let contents = std::fs::read_to_string(dir.path().join("echo.log")).unwrap();
            assert!(contents.contains(r#"STDIN: {"cmd":"ping"}"#));
            assert!(contents.contains(r#"STDOUT: {"cmd":"ping"}"#));
        }
    }
}
