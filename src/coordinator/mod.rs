//! Execution coordinator.
//!
//! [`Executor::execute`] turns an [`ExecutionRequest`] into one worker call:
//! validate, acquire (bounded wait), optionally reset, send, await the reply
//! under the per-call timeout, and release. The lease is released on every
//! path because it is dropped at the end of each attempt.
//!
//! # Retry policy
//!
//! A failed attempt is retried at most once, on another worker (the failed
//! one is always discarded), and only when the request cannot have produced
//! an observable side effect:
//!
//! | Failure                        | Retried when                            |
//! |--------------------------------|-----------------------------------------|
//! | request never reached a worker | always                                  |
//! | timeout after delivery         | never (the caller's time is spent)      |
//! | worker crash / protocol error  | `eval`, or `exec` without variables     |
//! | script error                   | never (it is a successful round trip)   |
//! | pool exhausted / shutting down | never                                   |

mod policy;
mod request;

pub use policy::{ModulePolicy, PolicyParseError};
pub use request::{ErrorInfo, ExecutionRequest, ExecutionResponse, Operation};

use crate::config::ExecutorConfig;
use crate::error::{ErrorKind, PyPoolError, Result};
use crate::metrics::MetricsCollector;
use crate::pool::{WorkerLease, WorkerPool};
use crate::worker::{WorkerOp, WorkerReply};
use policy::is_dotted_name;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How many times a single request may be sent to a worker.
const MAX_ATTEMPTS: u32 = 2;

/// Synchronous front end over a [`WorkerPool`].
pub struct Executor {
    pool: Arc<WorkerPool>,
    metrics: Arc<MetricsCollector>,
    config: ExecutorConfig,
}

/// A failed attempt and what is known about how far it got.
struct AttemptError {
    error: PyPoolError,
    delivered: bool,
    worker_id: Option<usize>,
}

impl AttemptError {
    fn before_worker(error: PyPoolError) -> Self {
        Self {
            error,
            delivered: false,
            worker_id: None,
        }
    }
}

/// Outcome of [`Executor::reset_workers`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub reset: usize,
    pub failed: usize,
}

impl Executor {
    pub fn new(pool: Arc<WorkerPool>, metrics: Arc<MetricsCollector>, config: ExecutorConfig) -> Self {
        Self {
            pool,
            metrics,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one request. Never fails: every outcome is described by the
    /// returned response, and every outcome is recorded in the metrics.
    #[instrument(level = "debug", skip_all, fields(op = request.operation.name()))]
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResponse {
        let start = Instant::now();
        let _active = self.metrics.start_execution();

        let response = match validate(&self.config, request) {
            Ok(()) => self.run(request, start),
            Err(e) => {
                debug!(error = %e, "Rejected request");
                ExecutionResponse::from_error(&e, start.elapsed())
            }
        };

        self.metrics.record(start.elapsed(), response.error_kind());
        response
    }

    fn run(&self, request: &ExecutionRequest, start: Instant) -> ExecutionResponse {
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let op = request.operation.to_worker_op();

        let mut attempt = 1;
        loop {
            match self.attempt(&op, request.fresh, timeout) {
                Ok((worker_id, WorkerReply::Success { value, output })) => {
                    return ExecutionResponse::success(value, output, start.elapsed())
                        .on_worker(worker_id);
                }
                Ok((worker_id, WorkerReply::ExecutionError { error, output })) => {
                    debug!(
                        worker_id,
                        exception = error.exception_type.as_deref().unwrap_or("?"),
                        "Script raised an error"
                    );
                    return ExecutionResponse::failure(error.into(), output, start.elapsed())
                        .on_worker(worker_id);
                }
                Err(failure) => {
                    if attempt < MAX_ATTEMPTS && should_retry(&request.operation, &failure) {
                        attempt += 1;
                        self.metrics.record_retry();
                        info!(
                            worker_id = failure.worker_id,
                            error = %failure.error,
                            "Retrying on another worker"
                        );
                        continue;
                    }

                    warn!(
                        worker_id = failure.worker_id,
                        kind = %failure.error.kind(),
                        error = %failure.error,
                        "Execution failed"
                    );
                    let response = ExecutionResponse::from_error(&failure.error, start.elapsed());
                    return match failure.worker_id {
                        Some(id) => response.on_worker(id),
                        None => response,
                    };
                }
            }
        }
    }

    fn attempt(
        &self,
        op: &WorkerOp,
        fresh: bool,
        timeout: Duration,
    ) -> std::result::Result<(usize, WorkerReply), AttemptError> {
        let mut lease = self.acquire()?;
        let worker_id = lease.worker_id();

        if fresh {
            reset_lease(&mut lease, timeout).map_err(|error| AttemptError {
                error,
                delivered: false,
                worker_id: Some(worker_id),
            })?;
        }

        lease
            .call(op, timeout)
            .map(|reply| (worker_id, reply))
            .map_err(|e| AttemptError {
                error: e.error,
                delivered: e.delivered,
                worker_id: Some(worker_id),
            })
    }

    fn acquire(&self) -> std::result::Result<WorkerLease, AttemptError> {
        let wait_start = Instant::now();
        let lease = self.pool.acquire(self.config.acquire_timeout);
        self.metrics.record_pool_wait(wait_start.elapsed());
        lease.map_err(AttemptError::before_worker)
    }

    /// Query the interpreter version from any worker.
    pub fn version(&self) -> Result<Value> {
        self.query(&WorkerOp::Version)
    }

    /// Installed distribution names, as seen by any worker.
    pub fn list_modules(&self) -> Result<Vec<String>> {
        let value = self.query(&WorkerOp::ListModules)?;
        serde_json::from_value(value)
            .map_err(|e| PyPoolError::Protocol(format!("malformed module list: {}", e)))
    }

    /// Run an introspection op on any worker. These ops bypass the metrics.
    fn query(&self, op: &WorkerOp) -> Result<Value> {
        let mut lease = self.acquire().map_err(|e| e.error)?;
        match lease.call(op, self.config.default_timeout) {
            Ok(WorkerReply::Success { value, .. }) => Ok(value),
            Ok(WorkerReply::ExecutionError { error, .. }) => Err(PyPoolError::Protocol(format!(
                "{} query failed: {}",
                op.name(),
                error.message
            ))),
            Err(e) => Err(e.error),
        }
    }

    /// Clear the namespace of every idle worker.
    ///
    /// Busy workers keep their state; requests that need a clean namespace
    /// regardless should set [`ExecutionRequest::fresh`].
    pub fn reset_workers(&self) -> ResetSummary {
        let idle = self.pool.stats().available;
        let mut leases = Vec::with_capacity(idle);
        for _ in 0..idle {
            match self.pool.acquire(Duration::ZERO) {
                Ok(lease) => leases.push(lease),
                Err(_) => break,
            }
        }

        let mut summary = ResetSummary::default();
        for mut lease in leases {
            match reset_lease(&mut lease, self.config.default_timeout) {
                Ok(()) => summary.reset += 1,
                Err(e) => {
                    warn!(worker_id = lease.worker_id(), error = %e, "Worker reset failed");
                    summary.failed += 1;
                }
            }
        }
        info!(reset = summary.reset, failed = summary.failed, "Reset idle workers");
        summary
    }
}

fn validate(config: &ExecutorConfig, request: &ExecutionRequest) -> Result<()> {
    let size = request.operation.payload_size();
    if size > config.max_payload_bytes {
        return Err(PyPoolError::PayloadTooLarge {
            size,
            limit: config.max_payload_bytes,
        });
    }
    if request.timeout.is_some_and(|t| t.is_zero()) {
        return Err(PyPoolError::InvalidRequest(
            "timeout must be greater than zero".into(),
        ));
    }

    match &request.operation {
        Operation::Exec { code, .. } if code.trim().is_empty() => Err(
            PyPoolError::InvalidRequest("code must not be empty".into()),
        ),
        Operation::Eval { expression, .. } if expression.trim().is_empty() => Err(
            PyPoolError::InvalidRequest("expression must not be empty".into()),
        ),
        Operation::CallModule {
            module, function, ..
        } => {
            if !is_dotted_name(module) {
                return Err(PyPoolError::InvalidRequest(format!(
                    "'{}' is not a valid module name",
                    module
                )));
            }
            if !is_dotted_name(function) {
                return Err(PyPoolError::InvalidRequest(format!(
                    "'{}' is not a valid function name",
                    function
                )));
            }
            match &config.module_policy {
                Some(policy) => policy.check(module, function),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

fn reset_lease(lease: &mut WorkerLease, timeout: Duration) -> Result<()> {
    match lease.call(&WorkerOp::Reset, timeout) {
        Ok(WorkerReply::Success { .. }) => Ok(()),
        Ok(WorkerReply::ExecutionError { error, .. }) => {
            lease.mark_unhealthy();
            Err(PyPoolError::Protocol(format!(
                "reset failed on worker {}: {}",
                lease.worker_id(),
                error.message
            )))
        }
        Err(e) => Err(e.error),
    }
}

fn should_retry(operation: &Operation, failure: &AttemptError) -> bool {
    if failure.worker_id.is_none() {
        return false;
    }
    if !failure.delivered {
        return true;
    }
    match failure.error.kind() {
        // The caller's timeout is already spent, and code that blocked once
        // will block again.
        ErrorKind::Timeout => false,
        ErrorKind::WorkerCrashed | ErrorKind::ProtocolError => operation.is_replayable(),
        _ => false,
    }
}
