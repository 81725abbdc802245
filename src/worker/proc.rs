//! Process handle for worker subprocesses.
//!
//! Wraps a child process with IPC channels for communication.

use super::ipc::{LineReader, LineWriter, PipeFd, ReadLine};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PyPoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

/// Handle to a worker subprocess with IPC channels.
#[derive(Debug)]
pub struct Proc {
    /// Process ID
    pid: Pid,
    /// Writer for sending requests to the worker; `None` once stdin is closed.
    writer: Option<LineWriter>,
    /// Reader for receiving responses from the worker
    reader: LineReader,
    /// Exit status, once the process has been reaped
    exit: Option<TerminationReason>,
}

impl Proc {
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            pid,
            writer: Some(LineWriter::new(stdin)),
            reader: LineReader::new(stdout),
            exit: None,
        }
    }

    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout. The child is reaped
    /// through `waitpid` from here on, never through the `Child` handle.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PyPoolError::Startup("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PyPoolError::Startup("Child stdout not captured".into()))?;

        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Write one line to the worker's stdin.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_line(line),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker stdin already closed",
            )),
        }
    }

    /// Read one line from the worker's stdout, waiting until `deadline`.
    pub fn read_line(&mut self, deadline: Option<Instant>) -> io::Result<ReadLine> {
        self.reader.read_line(deadline)
    }

    /// Discard every line that is already readable. See [`LineReader::drain_ready`].
    pub fn drain_ready(&mut self) -> io::Result<(Vec<String>, bool)> {
        self.reader.drain_ready()
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` while the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = &self.exit {
            return Ok(Some(reason.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let reason = analyze_wait_status(status);
                self.exit = Some(reason.clone());
                Ok(Some(reason))
            }
            Err(nix::errno::Errno::ECHILD) => {
                self.exit = Some(TerminationReason::Unknown);
                Ok(Some(TerminationReason::Unknown))
            }
            Err(e) => Err(PyPoolError::Io(io::Error::from_raw_os_error(e as i32))),
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<TerminationReason> {
        let start = Instant::now();
        loop {
            if let Ok(Some(reason)) = self.try_wait() {
                return Some(reason);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| PyPoolError::Io(io::Error::from_raw_os_error(e as i32)))
    }

    /// Send SIGKILL to the process and reap it.
    pub fn kill(&mut self) -> TerminationReason {
        if let Some(reason) = &self.exit {
            return reason.clone();
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let reason = match waitpid(self.pid, None) {
            Ok(status) => analyze_wait_status(status),
            Err(_) => TerminationReason::Unknown,
        };
        self.exit = Some(reason.clone());
        reason
    }

    /// Gracefully stop the worker: close stdin, wait, then SIGTERM, then SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> TerminationReason {
        // The worker loop exits when it reads EOF.
        self.writer = None;
        if let Some(reason) = self.wait_timeout(timeout) {
            return reason;
        }

        let _ = self.terminate();
        if let Some(reason) = self.wait_timeout(Duration::from_millis(100)) {
            return reason;
        }

        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.terminate();
            if self.wait_timeout(Duration::from_millis(10)).is_none() {
                self.kill();
            }
        }
    }
}
