//! A single worker process and its bookkeeping.

use super::ipc::ReadLine;
use super::proc::Proc;
use super::protocol::{WireResponse, WorkerOp, WorkerReply, encode_request, truncate};
use super::signals::{TerminationReason, WorkerFailure};
use super::spawn::{WorkerSpec, spawn_worker};
use crate::error::{PyPoolError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Available,
    InUse,
    Unhealthy,
    Terminated,
}

/// A failed call, with whether the request reached the worker.
///
/// An undelivered request had no chance to cause side effects, so the
/// coordinator may resubmit it regardless of the operation kind.
#[derive(Debug)]
pub struct CallError {
    pub error: PyPoolError,
    pub delivered: bool,
}

impl CallError {
    fn undelivered(error: PyPoolError) -> Self {
        Self {
            error,
            delivered: false,
        }
    }

    fn delivered(error: PyPoolError) -> Self {
        Self {
            error,
            delivered: true,
        }
    }
}

/// A worker process owned by the pool.
pub struct Worker {
    id: usize,
    proc: Proc,
    state: WorkerState,
    python_version: String,
    created_at: Instant,
    last_used: Instant,
    consecutive_failures: u32,
    requests_served: u64,
    next_request_id: u64,
}

impl Worker {
    /// Spawn a worker and complete its liveness handshake.
    pub fn spawn(id: usize, spec: &WorkerSpec) -> Result<Self> {
        let (proc, hello) = spawn_worker(spec)?;
        debug!(
            worker_id = id,
            pid = hello.pid,
            version = %hello.version,
            "Worker ready"
        );
        let now = Instant::now();
        Ok(Self {
            id,
            proc,
            state: WorkerState::Starting,
            python_version: hello.version,
            created_at: now,
            last_used: now,
            consecutive_failures: 0,
            requests_served: 0,
            next_request_id: 1,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> i32 {
        self.proc.pid().as_raw()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }

    pub fn python_version(&self) -> &str {
        &self.python_version
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn mark_unhealthy(&mut self) {
        self.state = WorkerState::Unhealthy;
    }

    pub fn is_unhealthy(&self) -> bool {
        self.state == WorkerState::Unhealthy
    }

    /// Send one operation and wait for its response until `timeout` elapses.
    ///
    /// Script faults come back as `Ok(WorkerReply::ExecutionError)`. Every
    /// `Err` leaves the worker marked unhealthy, because its stream position
    /// or interpreter state can no longer be trusted.
    pub fn call(
        &mut self,
        op: &WorkerOp,
        timeout: Duration,
    ) -> std::result::Result<WorkerReply, CallError> {
        let result = self.exchange(op, timeout);
        self.last_used = Instant::now();
        match &result {
            Ok(WorkerReply::Success { .. }) => {
                self.consecutive_failures = 0;
            }
            Ok(WorkerReply::ExecutionError { .. }) => {
                self.consecutive_failures += 1;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.mark_unhealthy();
                debug!(
                    worker_id = self.id,
                    op = op.name(),
                    delivered = e.delivered,
                    error = %e.error,
                    "Worker call failed"
                );
            }
        }
        if matches!(op, WorkerOp::Exec { .. } | WorkerOp::Eval { .. } | WorkerOp::CallModule { .. })
        {
            self.requests_served += 1;
        }
        result
    }

    fn exchange(
        &mut self,
        op: &WorkerOp,
        timeout: Duration,
    ) -> std::result::Result<WorkerReply, CallError> {
        let id = self.next_request_id;
        self.next_request_id += 1;

        let line = encode_request(id, op).map_err(|e| CallError::undelivered(e.into()))?;
        let deadline = Instant::now() + timeout;
        let send_start = Instant::now();
        if let Err(e) = self.proc.send_line(&line) {
            let crashed = self.crash_error(&format!("sending {} ({})", op.name(), e));
            return Err(CallError::undelivered(crashed));
        }
        let send_time = send_start.elapsed();

        loop {
            let line = match self.proc.read_line(Some(deadline)) {
                Ok(ReadLine::Line(line)) => line,
                Ok(ReadLine::TimedOut) => {
                    return Err(CallError::delivered(PyPoolError::Timeout { timeout }));
                }
                Ok(ReadLine::Eof) => {
                    return Err(CallError::delivered(
                        self.crash_error(&format!("running {}", op.name())),
                    ));
                }
                Err(e) => {
                    return Err(CallError::delivered(PyPoolError::Protocol(format!(
                        "Failed to read from worker {}: {}",
                        self.id, e
                    ))));
                }
            };

            let response = WireResponse::from_line(&line).map_err(|e| {
                CallError::delivered(PyPoolError::Protocol(format!(
                    "Invalid response from worker {} ({}): {}",
                    self.id,
                    e,
                    truncate(&line, 200)
                )))
            })?;

            if response.id < id {
                // Answer to a request that was already abandoned.
                warn!(
                    worker_id = self.id,
                    stale_id = response.id,
                    expected_id = id,
                    "Discarding stale worker response"
                );
                continue;
            }
            if response.id > id {
                return Err(CallError::delivered(PyPoolError::Protocol(format!(
                    "Worker {} answered unknown request {} (expected {})",
                    self.id, response.id, id
                ))));
            }

            trace!(
                worker_id = self.id,
                op = op.name(),
                send_time_us = send_time.as_micros() as u64,
                worker_elapsed_ms = response.elapsed_ms.unwrap_or_default(),
                "Worker IPC request/response"
            );

            return response.into_reply().map_err(|v| {
                CallError::delivered(PyPoolError::Protocol(format!(
                    "Worker {}: {}",
                    self.id, v
                )))
            });
        }
    }

    /// Health probe: a no-op round trip under a short timeout.
    pub fn ping(&mut self, timeout: Duration) -> Result<()> {
        match self.call(&WorkerOp::Ping, timeout) {
            Ok(WorkerReply::Success { .. }) => Ok(()),
            Ok(WorkerReply::ExecutionError { error, .. }) => {
                self.mark_unhealthy();
                Err(PyPoolError::Protocol(format!(
                    "Ping failed on worker {}: {}",
                    self.id, error.message
                )))
            }
            Err(e) => Err(e.error),
        }
    }

    /// Discard any response lines that arrived after their caller stopped waiting.
    ///
    /// Returns the number of discarded lines. A closed stream marks the worker
    /// unhealthy.
    pub fn drain_stale(&mut self) -> usize {
        match self.proc.drain_ready() {
            Ok((lines, closed)) => {
                for line in &lines {
                    warn!(
                        worker_id = self.id,
                        line = truncate(line, 120),
                        "Discarding late worker output"
                    );
                }
                if closed {
                    self.mark_unhealthy();
                }
                lines.len()
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "Failed to drain worker output");
                self.mark_unhealthy();
                0
            }
        }
    }

    /// Check whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.proc.is_running()
    }

    /// Ask the worker to exit, escalating to signals after `grace`.
    pub fn stop(mut self, grace: Duration) -> TerminationReason {
        if self.state != WorkerState::Unhealthy
            && let Ok(line) = encode_request(self.next_request_id, &WorkerOp::Shutdown)
        {
            let _ = self.proc.send_line(&line);
        }
        let reason = self.proc.stop(grace);
        self.state = WorkerState::Terminated;
        debug!(worker_id = self.id, reason = %reason, "Worker stopped");
        reason
    }

    /// Kill the worker immediately.
    pub fn kill(mut self) -> TerminationReason {
        let reason = self.proc.kill();
        self.state = WorkerState::Terminated;
        debug!(worker_id = self.id, reason = %reason, "Worker killed");
        reason
    }

    fn crash_error(&mut self, context: &str) -> PyPoolError {
        let reason = self
            .proc
            .wait_timeout(Duration::from_millis(200))
            .unwrap_or(TerminationReason::Unknown);
        let failure = WorkerFailure::new(reason).with_context(context);
        warn!(worker_id = self.id, failure = %failure, "Worker died unexpectedly");
        PyPoolError::WorkerCrashed {
            worker_id: self.id,
            reason: failure.to_string(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.proc.pid())
            .field("state", &self.state)
            .field("requests_served", &self.requests_served)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::process::{Command, Stdio};

    /// A worker whose "interpreter" is a shell script replaying canned lines.
    fn scripted(script: &str) -> Worker {
        let child = Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sh");
        let now = Instant::now();
        Worker {
            id: 7,
            proc: Proc::from_child(child).expect("Failed to create Proc"),
            state: WorkerState::InUse,
            python_version: "3.12.0".into(),
            created_at: now,
            last_used: now,
            consecutive_failures: 0,
            requests_served: 0,
            next_request_id: 1,
        }
    }

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_call_skips_stale_reply() {
        let mut worker = scripted(
            r#"read l; echo '{"id":0,"ok":true,"result":"old"}'; echo '{"id":1,"ok":true,"result":"pong"}'; cat >/dev/null"#,
        );
        let reply = worker.call(&WorkerOp::Ping, LONG).unwrap();
        assert_eq!(
            reply,
            WorkerReply::Success {
                value: json!("pong"),
                output: None
            }
        );
        assert!(!worker.is_unhealthy());
        worker.kill();
    }

    #[test]
    fn test_late_reply_is_discarded_on_next_call() {
        // The first answer arrives after its caller gave up.
        let mut worker = scripted(
            r#"read l; sleep 0.3; echo '{"id":1,"ok":true,"result":"late"}'; read l; echo '{"id":2,"ok":true,"result":"second"}'; cat >/dev/null"#,
        );
        let err = worker
            .call(&WorkerOp::Ping, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err.error, PyPoolError::Timeout { .. }));
        assert!(err.delivered);
        assert!(worker.is_unhealthy());

        let reply = worker.call(&WorkerOp::Ping, LONG).unwrap();
        assert_eq!(
            reply,
            WorkerReply::Success {
                value: json!("second"),
                output: None
            }
        );
        worker.kill();
    }

    #[test]
    fn test_reply_to_unknown_request_is_protocol_error() {
        let mut worker =
            scripted(r#"read l; echo '{"id":9,"ok":true,"result":null}'; cat >/dev/null"#);
        let err = worker.call(&WorkerOp::Ping, LONG).unwrap_err();
        assert!(matches!(err.error, PyPoolError::Protocol(_)), "{:?}", err.error);
        assert!(err.delivered);
        assert!(worker.is_unhealthy());
        assert_eq!(worker.consecutive_failures(), 1);
        worker.kill();
    }

    #[test]
    fn test_drain_stale_discards_late_output() {
        let mut worker = scripted(
            r#"read l; sleep 0.2; echo '{"id":1,"ok":true,"result":"late"}'; cat >/dev/null"#,
        );
        let err = worker
            .call(&WorkerOp::Ping, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err.error, PyPoolError::Timeout { .. }));

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(worker.drain_stale(), 1);
        assert_eq!(worker.drain_stale(), 0);
        worker.kill();
    }

    #[test]
    fn test_closed_output_is_a_crash() {
        let mut worker = scripted("read l; exit 3");
        let err = worker.call(&WorkerOp::Ping, LONG).unwrap_err();
        assert!(
            matches!(err.error, PyPoolError::WorkerCrashed { worker_id: 7, .. }),
            "{:?}",
            err.error
        );
        assert!(worker.is_unhealthy());
    }

    #[test]
    fn test_script_error_keeps_worker_usable() {
        let mut worker = scripted(
            r#"read l; echo '{"id":1,"ok":false,"error":{"kind":"execution","type":"ValueError","message":"bad"}}'; cat >/dev/null"#,
        );
        let eval = WorkerOp::Eval {
            expression: "int('x')".into(),
            variables: Default::default(),
        };
        match worker.call(&eval, LONG).unwrap() {
            WorkerReply::ExecutionError { error, .. } => {
                assert_eq!(error.exception_type.as_deref(), Some("ValueError"));
            }
            other => panic!("expected a script error, got {:?}", other),
        }
        assert!(!worker.is_unhealthy());
        assert_eq!(worker.requests_served(), 1);
        worker.kill();
    }
}
