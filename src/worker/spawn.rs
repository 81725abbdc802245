//! Worker subprocess spawning.
//!
//! Workers are plain interpreter processes started via `std::process::Command`
//! with the embedded bridge program passed on the command line.

use super::ipc::ReadLine;
use super::proc::Proc;
use super::protocol::{Hello, truncate};
use crate::error::{PyPoolError, Result};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// The interpreter loop every worker runs.
pub const BRIDGE_SOURCE: &str = include_str!("bridge.py");

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Interpreter executable.
    pub interpreter: PathBuf,
    /// How long a new worker may take to print its hello line.
    pub startup_timeout: Duration,
}

/// Spawn a worker subprocess and wait for its liveness handshake.
///
/// On any failure the half-started process is killed before returning.
pub fn spawn_worker(spec: &WorkerSpec) -> Result<(Proc, Hello)> {
    let mut cmd = Command::new(&spec.interpreter);
    cmd.arg("-u").arg("-c").arg(BRIDGE_SOURCE);

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit()); // Tracebacks and stray prints go to our stderr

    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd.env("PYTHONUNBUFFERED", "1");

    // Keep terminal signals (Ctrl+C) away from workers; the pool stops them.
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| {
        PyPoolError::Startup(format!(
            "Failed to spawn {}: {}",
            spec.interpreter.display(),
            e
        ))
    })?;

    let mut proc = Proc::from_child(child)?;
    match await_hello(&mut proc, spec.startup_timeout) {
        Ok(hello) => Ok((proc, hello)),
        Err(e) => {
            proc.kill();
            Err(e)
        }
    }
}

fn await_hello(proc: &mut Proc, timeout: Duration) -> Result<Hello> {
    let deadline = Instant::now() + timeout;
    let line = match proc.read_line(Some(deadline)) {
        Ok(ReadLine::Line(line)) => line,
        Ok(ReadLine::Eof) => {
            let reason = proc
                .wait_timeout(Duration::from_millis(200))
                .map(|r| r.to_string())
                .unwrap_or_else(|| "closed its output".to_string());
            return Err(PyPoolError::Startup(format!(
                "Worker exited before the handshake ({})",
                reason
            )));
        }
        Ok(ReadLine::TimedOut) => {
            return Err(PyPoolError::Startup(format!(
                "Worker did not complete the handshake within {}ms",
                timeout.as_millis()
            )));
        }
        Err(e) => {
            return Err(PyPoolError::Startup(format!(
                "Failed to read handshake: {}",
                e
            )));
        }
    };

    Hello::from_line(&line).map_err(|e| {
        PyPoolError::Startup(format!(
            "Invalid handshake '{}': {}",
            truncate(&line, 120),
            e
        ))
    })
}
