//! Worker side of a transport: reads the process's own stdin, writes stdout.
//!
//! Two read strategies exist. [`ReadStrategy::Readiness`] registers stdin
//! with the tokio reactor and only reads once the descriptor is readable.
//! [`ReadStrategy::Threaded`] runs blocking line reads on a dedicated thread
//! and hands lines over a channel. Both are cancel-safe and both surface end
//! of input as [`Termination::EndOfStream`].

use std::io::{self, BufRead, BufReader, Write};
use std::thread;

use serde::Serialize;
use tokio::sync::mpsc;

use super::{Termination, Transport, TransportError};
use crate::message::{decode_line, encode_line, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Wait for readiness on the input descriptor, then read without blocking.
    Readiness,
    /// Block on a background thread.
    Threaded,
}

enum LineSource {
    #[cfg(unix)]
    Ready(ready::ReadyFd),
    Threaded(mpsc::UnboundedReceiver<io::Result<Vec<u8>>>),
}

/// Worker end of a controller pipe.
pub struct ChildTransport {
    source: LineSource,
    sink: Box<dyn Write + Send>,
}

impl ChildTransport {
    /// Transport over this process's stdin and stdout.
    ///
    /// Picks [`ReadStrategy::Readiness`] when running inside a tokio runtime
    /// on unix and stdin is a pipe or socket distinct from stdout, and falls
    /// back to [`ReadStrategy::Threaded`] otherwise.
    pub fn stdio() -> Self {
        #[cfg(unix)]
        if tokio::runtime::Handle::try_current().is_ok()
            && ready::is_pollable(libc::STDIN_FILENO)
            && !ready::same_file(libc::STDIN_FILENO, libc::STDOUT_FILENO)
        {
            match ready::ReadyFd::new(libc::STDIN_FILENO) {
                Ok(source) => {
                    return Self {
                        source: LineSource::Ready(source),
                        sink: Box::new(io::stdout()),
                    }
                }
                Err(err) => log::debug!("stdin not pollable ({err}); reading on a thread"),
            }
        }
        Self::from_parts(BufReader::new(io::stdin()), io::stdout())
    }

    /// Transport over stdio with an explicit read strategy.
    pub fn with_strategy(strategy: ReadStrategy) -> io::Result<Self> {
        match strategy {
            ReadStrategy::Threaded => Ok(Self::from_parts(BufReader::new(io::stdin()), io::stdout())),
            #[cfg(unix)]
            ReadStrategy::Readiness => Ok(Self {
                source: LineSource::Ready(ready::ReadyFd::new(libc::STDIN_FILENO)?),
                sink: Box::new(io::stdout()),
            }),
            #[cfg(not(unix))]
            ReadStrategy::Readiness => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "readiness reads need a unix descriptor",
            )),
        }
    }

    /// Transport over arbitrary streams, read with [`ReadStrategy::Threaded`].
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            source: LineSource::Threaded(spawn_reader(reader)),
            sink: Box::new(writer),
        }
    }

    pub fn strategy(&self) -> ReadStrategy {
        match self.source {
            #[cfg(unix)]
            LineSource::Ready(_) => ReadStrategy::Readiness,
            LineSource::Threaded(_) => ReadStrategy::Threaded,
        }
    }

    /// Next message from the controller. Malformed lines are skipped.
    pub async fn get(&mut self) -> Result<Message, TransportError> {
        loop {
            let line = match &mut self.source {
                #[cfg(unix)]
                LineSource::Ready(fd) => fd.next_line().await,
                LineSource::Threaded(lines) => lines.recv().await.transpose(),
            };
            if let Some(message) = accept(line)? {
                return Ok(message);
            }
        }
    }

    /// Blocking form of [`ChildTransport::get`] for callers without an async
    /// context. Must not be called from inside a runtime worker when the
    /// strategy is [`ReadStrategy::Threaded`].
    pub fn get_blocking(&mut self) -> Result<Message, TransportError> {
        loop {
            let line = match &mut self.source {
                #[cfg(unix)]
                LineSource::Ready(fd) => fd.next_line_blocking(),
                LineSource::Threaded(lines) => lines.blocking_recv().transpose(),
            };
            if let Some(message) = accept(line)? {
                return Ok(message);
            }
        }
    }

    /// Write one message to the controller, flushed immediately.
    pub async fn put<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), TransportError> {
        self.put_blocking(message)
    }

    pub fn put_blocking<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), TransportError> {
        let line = encode_line(message)?;
        self.sink
            .write_all(line.as_bytes())
            .and_then(|()| self.sink.flush())
            .map_err(|err| {
                log::warn!("worker output write failed: {err}");
                TransportError::Terminal(Termination::Broken)
            })
    }
}

impl Transport for ChildTransport {
    async fn get(&mut self) -> Result<Message, TransportError> {
        ChildTransport::get(self).await
    }

    async fn put(&mut self, message: &Message) -> Result<(), TransportError> {
        ChildTransport::put(self, message).await
    }
}

/// Map one raw read to a message, a skip (`Ok(None)`), or the terminal error.
fn accept(line: io::Result<Option<Vec<u8>>>) -> Result<Option<Message>, TransportError> {
    match line {
        Ok(Some(line)) => Ok(decode_line(&line)),
        Ok(None) => Err(TransportError::Terminal(Termination::EndOfStream)),
        Err(err) => {
            log::warn!("worker input read failed: {err}");
            Err(TransportError::Terminal(Termination::Broken))
        }
    }
}

/// Read lines on a background thread until end of input or the receiver goes away.
fn spawn_reader<R>(mut reader: R) -> mpsc::UnboundedReceiver<io::Result<Vec<u8>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if tx.send(Ok(line)).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = tx.send(Err(err));
                break;
            }
        }
    });
    rx
}

#[cfg(unix)]
mod ready {
    use std::io;
    use std::mem;
    use std::os::unix::io::{AsRawFd, RawFd};

    use tokio::io::unix::AsyncFd;

    use crate::message::take_line;

    const READ_CHUNK: usize = 4096;

    fn stat(fd: RawFd) -> Option<libc::stat> {
        // SAFETY: fstat writes into a zeroed stat buffer we own.
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return None;
        }
        Some(stat)
    }

    /// True for pipes and sockets, the descriptors epoll can watch.
    pub(super) fn is_pollable(fd: RawFd) -> bool {
        stat(fd).map_or(false, |stat| {
            let kind = stat.st_mode & libc::S_IFMT;
            kind == libc::S_IFIFO || kind == libc::S_IFSOCK
        })
    }

    /// True when both descriptors refer to the same file, e.g. a socket
    /// handed over as both stdin and stdout. O_NONBLOCK set on one then
    /// applies to writes on the other.
    pub(super) fn same_file(a: RawFd, b: RawFd) -> bool {
        match (stat(a), stat(b)) {
            (Some(a), Some(b)) => a.st_dev == b.st_dev && a.st_ino == b.st_ino,
            _ => false,
        }
    }

    /// A borrowed descriptor switched to non-blocking mode and registered
    /// with the reactor. The original flags are restored on drop.
    pub(super) struct ReadyFd {
        fd: AsyncFd<RawFd>,
        original_flags: libc::c_int,
        pending: Vec<u8>,
        chunk: Box<[u8; READ_CHUNK]>,
        eof: bool,
    }

    impl ReadyFd {
        pub(super) fn new(raw: RawFd) -> io::Result<Self> {
            // SAFETY: fcntl on a descriptor owned by this process.
            let original_flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
            if original_flags < 0 {
                return Err(io::Error::last_os_error());
            }
            set_flags(raw, original_flags | libc::O_NONBLOCK)?;
            match AsyncFd::new(raw) {
                Ok(fd) => Ok(Self {
                    fd,
                    original_flags,
                    pending: Vec::new(),
                    chunk: Box::new([0; READ_CHUNK]),
                    eof: false,
                }),
                Err(err) => {
                    let _ = set_flags(raw, original_flags);
                    Err(err)
                }
            }
        }

        /// Next raw line, or `None` at end of input. A final unterminated
        /// line is returned before the end is reported.
        pub(super) async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
            loop {
                if let Some(line) = self.buffered() {
                    return Ok(line);
                }
                let read = {
                    let mut guard = self.fd.readable().await?;
                    let chunk = &mut self.chunk;
                    match guard.try_io(|fd| read_fd(fd.as_raw_fd(), &mut chunk[..])) {
                        Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Ok(read) => read?,
                        Err(_would_block) => continue,
                    }
                };
                self.consume(read);
            }
        }

        pub(super) fn next_line_blocking(&mut self) -> io::Result<Option<Vec<u8>>> {
            let raw = self.fd.as_raw_fd();
            loop {
                if let Some(line) = self.buffered() {
                    return Ok(line);
                }
                wait_readable(raw)?;
                match read_fd(raw, &mut self.chunk[..]) {
                    Ok(read) => self.consume(read),
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        /// `Some(answer)` when the buffer alone decides the next result.
        fn buffered(&mut self) -> Option<Option<Vec<u8>>> {
            if let Some(line) = take_line(&mut self.pending) {
                return Some(Some(line));
            }
            if !self.eof {
                return None;
            }
            if self.pending.is_empty() {
                Some(None)
            } else {
                Some(Some(mem::take(&mut self.pending)))
            }
        }

        fn consume(&mut self, read: usize) {
            if read == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&self.chunk[..read]);
            }
        }
    }

    impl Drop for ReadyFd {
        fn drop(&mut self) {
            let _ = set_flags(self.fd.as_raw_fd(), self.original_flags);
        }
    }

    fn set_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
        // SAFETY: fcntl on a descriptor owned by this process.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() writable bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn wait_readable(fd: RawFd) -> io::Result<()> {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: one valid pollfd, infinite timeout.
            if unsafe { libc::poll(&mut pollfd, 1, -1) } >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
