//! Deterministic subprocess termination.
//!
//! A [`ProcessGuard`] exclusively owns a process handle and guarantees it is
//! killed exactly once. The primary path is explicit: the owner calls
//! [`ProcessGuard::kill`] (or [`ProcessGuard::release`]) when its scope ends.
//! Dropping a guard that was never released runs the same kill as a backstop.
//!
//! Handles with different liveness conventions are normalized through the
//! [`Supervised`] trait:
//! - `std::process::Child` and `tokio::process::Child` report an exit status
//!   that is unset while the process runs (`try_wait`),
//! - [`ProbedProcess`] adapts anything else from a poll-style exit-code probe
//!   and a kill function.

use std::io;

use serde::Serialize;

/// Exit status observed for a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A process handle the guard knows how to probe and kill.
pub trait Supervised {
    /// True while the process has not exited.
    ///
    /// A probe that fails counts as "not running" so the guard never kills a
    /// handle it cannot reason about.
    fn is_running(&mut self) -> bool;

    /// Forcefully terminate the process.
    fn force_kill(&mut self) -> io::Result<()>;

    /// OS process id, when known.
    fn pid(&self) -> Option<u32> {
        None
    }
}

impl Supervised for std::process::Child {
    fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.kill()?;
        // Reap so the child does not linger as a zombie.
        self.wait().map(|_| ())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.id())
    }
}

impl Supervised for tokio::process::Child {
    fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    fn force_kill(&mut self) -> io::Result<()> {
        // tokio reaps killed children in the background.
        self.start_kill()
    }

    fn pid(&self) -> Option<u32> {
        self.id()
    }
}

/// Adapter for handles exposing a poll-style probe: `None` while running,
/// `Some(exit_code)` once finished.
pub struct ProbedProcess<H, P, K>
where
    P: FnMut(&mut H) -> Option<i32>,
    K: FnMut(&mut H) -> io::Result<()>,
{
    handle: H,
    probe: P,
    kill: K,
}

impl<H, P, K> ProbedProcess<H, P, K>
where
    P: FnMut(&mut H) -> Option<i32>,
    K: FnMut(&mut H) -> io::Result<()>,
{
    pub fn new(handle: H, probe: P, kill: K) -> Self {
        Self {
            handle,
            probe,
            kill,
        }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

impl<H, P, K> Supervised for ProbedProcess<H, P, K>
where
    P: FnMut(&mut H) -> Option<i32>,
    K: FnMut(&mut H) -> io::Result<()>,
{
    fn is_running(&mut self) -> bool {
        (self.probe)(&mut self.handle).is_none()
    }

    fn force_kill(&mut self) -> io::Result<()> {
        (self.kill)(&mut self.handle)
    }
}

/// Exclusive owner of one process handle; kills it exactly once.
pub struct ProcessGuard<P: Supervised> {
    process: P,
    released: bool,
}

impl<P: Supervised> ProcessGuard<P> {
    pub fn new(process: P) -> Self {
        Self {
            process,
            released: false,
        }
    }

    /// Borrow the handle, e.g. to await its exit.
    pub fn process_mut(&mut self) -> &mut P {
        &mut self.process
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    /// True once the kill path has run, explicitly or via drop.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Kill the process if it is still running.
    ///
    /// Idempotent: only the first call can reach the process. Never fails;
    /// kill errors are logged and swallowed.
    pub fn kill(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.process.is_running() {
            return;
        }
        if let Err(err) = self.process.force_kill() {
            log::debug!("ignoring kill failure for pid {:?}: {}", self.pid(), err);
        }
    }

    /// Ask a running process to exit on its own.
    ///
    /// Sends SIGTERM on unix. Elsewhere there is no polite signal, so this
    /// falls through to [`ProcessGuard::kill`].
    pub fn interrupt(&mut self) {
        if self.released || !self.process.is_running() {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.process.pid() {
            // SAFETY: kill(2) with a pid we own and a valid signal number.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                log::debug!(
                    "SIGTERM to pid {} failed: {}",
                    pid,
                    io::Error::last_os_error()
                );
            }
            return;
        }
        self.kill();
    }

    /// Explicit end-of-scope release: kill and consume the guard.
    pub fn release(mut self) {
        self.kill();
    }
}

impl<P: Supervised> Drop for ProcessGuard<P> {
    fn drop(&mut self) {
        if !self.released {
            log::debug!("process guard for pid {:?} dropped unreleased", self.pid());
            self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Probe {
        running: AtomicBool,
        kills: AtomicUsize,
        fail_kill: AtomicBool,
    }

    fn fake(probe: &Arc<Probe>) -> impl Supervised {
        probe.running.store(true, Ordering::SeqCst);
        ProbedProcess::new(
            Arc::clone(probe),
            |p: &mut Arc<Probe>| {
                if p.running.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(0)
                }
            },
            |p: &mut Arc<Probe>| {
                p.kills.fetch_add(1, Ordering::SeqCst);
                if p.fail_kill.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
                }
                p.running.store(false, Ordering::SeqCst);
                Ok(())
            },
        )
    }

    mod kill {
        use super::*;

        #[test]
        fn explicit_then_drop_kills_once() {
            let probe = Arc::new(Probe::default());
            let mut guard = ProcessGuard::new(fake(&probe));
            guard.kill();
            guard.kill();
            drop(guard);
            assert_eq!(probe.kills.load(Ordering::SeqCst), 1);
            assert!(!probe.running.load(Ordering::SeqCst));
        }

        #[test]
        fn drop_backstop_kills() {
            let probe = Arc::new(Probe::default());
            {
                let _guard = ProcessGuard::new(fake(&probe));
            }
            assert_eq!(probe.kills.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn release_consumes_and_kills() {
            let probe = Arc::new(Probe::default());
            ProcessGuard::new(fake(&probe)).release();
            assert_eq!(probe.kills.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn exited_process_is_not_killed() {
            let probe = Arc::new(Probe::default());
            let mut guard = ProcessGuard::new(fake(&probe));
            probe.running.store(false, Ordering::SeqCst);
            guard.kill();
            assert_eq!(probe.kills.load(Ordering::SeqCst), 0);
            assert!(guard.is_released());
        }

        #[test]
        fn kill_failure_is_swallowed() {
            let probe = Arc::new(Probe::default());
            probe.fail_kill.store(true, Ordering::SeqCst);
            let mut guard = ProcessGuard::new(fake(&probe));
            guard.kill();
            drop(guard);
            assert_eq!(probe.kills.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn early_return_path_still_kills() {
            let probe = Arc::new(Probe::default());
            let work = |probe: &Arc<Probe>| -> Result<(), String> {
                let _guard = ProcessGuard::new(fake(probe));
                Err("failed midway".to_string())
            };
            assert!(work(&probe).is_err());
            assert_eq!(probe.kills.load(Ordering::SeqCst), 1);
        }
    }

    #[cfg(unix)]
    mod real_process {
        use super::*;
        use std::process::{Command, Stdio};

        #[test]
        fn std_child_is_killed() {
            let child = Command::new("sleep")
                .arg("30")
                .stdin(Stdio::null())
                .spawn()
                .unwrap();
            let mut guard = ProcessGuard::new(child);
            assert!(guard.is_running());
            guard.kill();
            assert!(!guard.is_running());
            guard.kill();
        }

        #[tokio::test]
        async fn tokio_child_is_killed() {
            let child = tokio::process::Command::new("sleep")
                .arg("30")
                .spawn()
                .unwrap();
            let mut guard = ProcessGuard::new(child);
            assert!(guard.is_running());
            guard.kill();
            let status = guard.process_mut().wait().await.unwrap();
            assert!(!status.success());
            assert_eq!(ProcessExit::from(status).signal, Some(libc::SIGKILL));
        }

        #[tokio::test]
        async fn interrupt_sends_sigterm() {
            let child = tokio::process::Command::new("sleep")
                .arg("30")
                .spawn()
                .unwrap();
            let mut guard = ProcessGuard::new(child);
            guard.interrupt();
            let status = guard.process_mut().wait().await.unwrap();
            assert_eq!(ProcessExit::from(status).signal, Some(libc::SIGTERM));
            guard.kill();
        }
    }
}
