//! Scoped worker acquisition.

use super::PoolInner;
use crate::error::Result;
use crate::worker::{CallError, Worker, WorkerOp, WorkerReply};
use std::sync::Arc;
use std::time::Duration;

/// Exclusive use of one worker, returned to the pool when dropped.
///
/// Dropping the lease is the only way a worker goes back, so every exit path
/// (success, error, timeout, panic unwinding) releases it exactly once.
pub struct WorkerLease {
    /// Always `Some` until the lease is dropped.
    worker: Option<Worker>,
    pool: Arc<PoolInner>,
}

impl WorkerLease {
    pub(super) fn new(worker: Worker, pool: Arc<PoolInner>) -> Self {
        Self {
            worker: Some(worker),
            pool,
        }
    }

    fn worker(&mut self) -> &mut Worker {
        self.worker
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease used after release"))
    }

    pub fn worker_id(&self) -> usize {
        match &self.worker {
            Some(worker) => worker.id(),
            None => unreachable!("lease used after release"),
        }
    }

    /// Run one operation on the leased worker. See [`Worker::call`].
    pub fn call(
        &mut self,
        op: &WorkerOp,
        timeout: Duration,
    ) -> std::result::Result<WorkerReply, CallError> {
        self.worker().call(op, timeout)
    }

    pub fn ping(&mut self, timeout: Duration) -> Result<()> {
        self.worker().ping(timeout)
    }

    /// Discard the worker on release instead of returning it to the pool.
    pub fn mark_unhealthy(&mut self) {
        self.worker().mark_unhealthy();
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.check_in(worker);
        }
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker)
            .finish()
    }
}
