//! Worker pool management.
//!
//! The pool owns every worker process. Callers borrow one through
//! [`WorkerPool::acquire`] and give it back by dropping the returned
//! [`WorkerLease`].
//!
//! All pool state sits behind one mutex: the queue of available workers, the
//! FIFO queue of blocked callers, and the counters describing workers that are
//! checked out, being respawned, or scheduled for retirement. A released
//! worker goes straight to the longest-waiting caller, so arrivals never jump
//! ahead of callers that are already queued. Counters are mirrored into
//! atomics after each change so [`WorkerPool::stats`] never takes the lock.
//!
//! Process spawning and graceful stops always run outside the lock, on
//! background threads, so a slow interpreter start never blocks acquire or
//! release traffic.

mod health;
mod lease;

pub use lease::WorkerLease;

use crate::config::PoolConfig;
use crate::error::{PyPoolError, Result};
use crate::interpreter;
use crate::worker::{Worker, WorkerSpec, WorkerState};
use health::HealthChecker;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

/// Point-in-time view of the pool, read without locking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// available + in use + respawning
    pub total_size: usize,
    pub available: usize,
    pub in_use: usize,
    pub respawning: usize,
    /// Workers that are running and not known to be unhealthy.
    pub healthy: usize,
    /// Size the pool is converging on.
    pub target_size: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    pub workers_spawned: u64,
    pub workers_replaced: u64,
    pub workers_retired: u64,
}

/// One idle worker, as listed in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: usize,
    pub pid: i32,
    pub python_version: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub requests_served: u64,
    pub consecutive_failures: u32,
}

impl WorkerInfo {
    fn of(worker: &Worker) -> Self {
        Self {
            id: worker.id(),
            pid: worker.pid(),
            python_version: worker.python_version().to_string(),
            age_ms: worker.age().as_millis() as u64,
            idle_ms: worker.idle_for().as_millis() as u64,
            requests_served: worker.requests_served(),
            consecutive_failures: worker.consecutive_failures(),
        }
    }
}

/// Result of one health-check pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub failed: usize,
    /// Replacements started to make up a size deficit.
    pub respawned: usize,
}

/// A pool of interpreter worker processes.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    health: Mutex<Option<HealthChecker>>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    spec: WorkerSpec,
    state: Mutex<PoolState>,
    gauges: Gauges,
    next_worker_id: AtomicUsize,
    next_waiter_id: AtomicU64,
}

struct PoolState {
    available: VecDeque<Worker>,
    waiters: VecDeque<Waiter>,
    handoffs: HashMap<u64, Handoff>,
    /// Worker id to pid, for every worker the pool still owns.
    live: HashMap<usize, i32>,
    target_size: usize,
    /// Checked out, or handed to a waiter that has not woken yet.
    in_use: usize,
    respawning: usize,
    /// Workers to stop as soon as they come back, to honor a shrink.
    retiring: usize,
    shutting_down: bool,
}

impl PoolState {
    fn total_size(&self) -> usize {
        self.available.len() + self.in_use + self.respawning
    }

    /// Size once pending retirements have happened.
    fn effective_size(&self) -> usize {
        self.total_size().saturating_sub(self.retiring)
    }
}

struct Waiter {
    id: u64,
    signal: Arc<Condvar>,
}

enum Handoff {
    Worker(Worker),
    ShuttingDown,
}

/// What to do with a worker coming back from a lease.
enum Release {
    Return,
    Retire,
    Discard,
}

#[derive(Default)]
struct Gauges {
    total: AtomicUsize,
    available: AtomicUsize,
    in_use: AtomicUsize,
    respawning: AtomicUsize,
    target: AtomicUsize,
    waiting: AtomicUsize,
    spawned: AtomicU64,
    replaced: AtomicU64,
    retired: AtomicU64,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Resolve the interpreter, spawn `config.size` workers, and start the
    /// health checker.
    ///
    /// Returns once every worker has either completed its handshake or failed.
    /// Fails when no worker starts at all; workers that fail individually are
    /// retried in the background.
    #[instrument(level = "debug", skip(config), fields(size = config.size))]
    pub fn start(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let interpreter = interpreter::resolve(&config).inspect_err(|e| {
            error!(error = %e, "No usable interpreter; worker pool cannot start");
        })?;

        let spec = WorkerSpec {
            interpreter,
            startup_timeout: config.startup_timeout,
        };
        info!(
            workers = config.size,
            interpreter = %spec.interpreter.display(),
            "Starting worker pool"
        );

        let results: Vec<Result<Worker>> = thread::scope(|s| {
            let handles: Vec<_> = (0..config.size)
                .map(|id| {
                    let spec = &spec;
                    s.spawn(move || Worker::spawn(id, spec))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(PyPoolError::Startup("Worker spawn thread panicked".into()))
                    })
                })
                .collect()
        });

        let mut workers = Vec::with_capacity(config.size);
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(worker) => workers.push(worker),
                Err(e) => failures.push(e),
            }
        }

        if workers.is_empty() {
            let first = failures
                .into_iter()
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no workers requested".to_string());
            error!(error = %first, "No worker completed its handshake");
            return Err(PyPoolError::Startup(format!(
                "none of the {} workers started: {}",
                config.size, first
            )));
        }
        for e in &failures {
            warn!(error = %e, "Worker failed to start; retrying in the background");
        }

        let mut state = PoolState {
            available: VecDeque::with_capacity(config.size),
            waiters: VecDeque::new(),
            handoffs: HashMap::new(),
            live: HashMap::new(),
            target_size: config.size,
            in_use: 0,
            respawning: failures.len(),
            retiring: 0,
            shutting_down: false,
        };
        let started = workers.len();
        for mut worker in workers {
            worker.set_state(WorkerState::Available);
            state.live.insert(worker.id(), worker.pid());
            state.available.push_back(worker);
        }

        let inner = Arc::new(PoolInner {
            next_worker_id: AtomicUsize::new(config.size),
            next_waiter_id: AtomicU64::new(0),
            spec,
            state: Mutex::new(state),
            gauges: Gauges::default(),
            config,
        });
        inner
            .gauges
            .spawned
            .fetch_add(started as u64, Ordering::Relaxed);
        inner.publish(&inner.lock());
        inner.spawn_replacements(failures.len());

        let health = if inner.config.health_check_interval.is_zero() {
            None
        } else {
            HealthChecker::start(Arc::clone(&inner), inner.config.health_check_interval)
        };

        info!(workers = started, "Worker pool ready");
        Ok(Self {
            inner,
            health: Mutex::new(health),
        })
    }

    /// Borrow a worker, waiting up to `timeout` for one to become available.
    ///
    /// Waiting callers are served in arrival order.
    pub fn acquire(&self, timeout: Duration) -> Result<WorkerLease> {
        self.inner.acquire(timeout)
    }

    /// Return a worker to the pool. Equivalent to dropping the lease.
    pub fn release(&self, lease: WorkerLease) {
        drop(lease);
    }

    /// Probe every available worker once and restore any size deficit.
    pub fn health_check(&self) -> HealthReport {
        self.inner.health_check()
    }

    /// Change the number of workers.
    ///
    /// Growing spawns new workers in the background. Shrinking stops idle
    /// workers first; busy workers are retired when their caller releases
    /// them, never killed mid-call.
    pub fn resize(&self, new_size: usize) -> Result<()> {
        self.inner.resize(new_size)
    }

    /// Workers currently waiting in the pool, in acquire order.
    ///
    /// Takes the pool lock briefly; checked-out workers are not listed.
    pub fn idle_workers(&self) -> Vec<WorkerInfo> {
        self.inner.lock().available.iter().map(WorkerInfo::of).collect()
    }

    /// Lock-free snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn interpreter(&self) -> &Path {
        &self.inner.spec.interpreter
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.gauges.shutting_down.load(Ordering::Acquire)
    }

    /// Stop every worker and fail all blocked and future `acquire` calls
    /// with [`PyPoolError::ShuttingDown`].
    ///
    /// Workers still checked out get `stop_grace` to come back before they
    /// are killed. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            for waiter in state.waiters.drain(..).collect::<Vec<_>>() {
                state.handoffs.insert(waiter.id, Handoff::ShuttingDown);
                waiter.signal.notify_one();
            }
            let idle: Vec<Worker> = state.available.drain(..).collect();
            for worker in &idle {
                state.live.remove(&worker.id());
            }
            self.inner.publish(&state);
            idle
        };
        info!(idle = idle.len(), "Shutting down worker pool");

        let checker = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(checker) = checker {
            checker.stop();
        }

        let grace = self.inner.config.stop_grace;
        let stopped = idle.len() as u64;
        thread::scope(|s| {
            for worker in idle {
                s.spawn(move || worker.stop(grace));
            }
        });
        self.inner
            .gauges
            .retired
            .fetch_add(stopped, Ordering::Relaxed);

        // Give in-flight calls a chance to finish and release normally.
        let start = Instant::now();
        while start.elapsed() < grace && self.inner.gauges.in_use.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_millis(10));
        }

        let leftover: Vec<(usize, i32)> = self
            .inner
            .lock()
            .live
            .iter()
            .map(|(id, pid)| (*id, *pid))
            .collect();
        for (worker_id, pid) in leftover {
            warn!(worker_id, pid, "Killing worker still in use at shutdown");
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        }

        info!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &PoolState) {
        let g = &self.gauges;
        g.total.store(state.total_size(), Ordering::Release);
        g.available.store(state.available.len(), Ordering::Release);
        g.in_use.store(state.in_use, Ordering::Release);
        g.respawning.store(state.respawning, Ordering::Release);
        g.target.store(state.target_size, Ordering::Release);
        g.waiting.store(state.waiters.len(), Ordering::Release);
        g.shutting_down
            .store(state.shutting_down, Ordering::Release);
    }

    fn stats(&self) -> PoolStats {
        let g = &self.gauges;
        let available = g.available.load(Ordering::Acquire);
        let in_use = g.in_use.load(Ordering::Acquire);
        PoolStats {
            total_size: g.total.load(Ordering::Acquire),
            available,
            in_use,
            respawning: g.respawning.load(Ordering::Acquire),
            healthy: available + in_use,
            target_size: g.target.load(Ordering::Acquire),
            waiting: g.waiting.load(Ordering::Acquire),
            workers_spawned: g.spawned.load(Ordering::Relaxed),
            workers_replaced: g.replaced.load(Ordering::Relaxed),
            workers_retired: g.retired.load(Ordering::Relaxed),
        }
    }

    fn lease(self: &Arc<Self>, mut worker: Worker) -> WorkerLease {
        worker.set_state(WorkerState::InUse);
        WorkerLease::new(worker, Arc::clone(self))
    }

    fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<WorkerLease> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.lock();
        if state.shutting_down {
            return Err(PyPoolError::ShuttingDown);
        }

        if state.waiters.is_empty()
            && let Some(worker) = state.available.pop_front()
        {
            state.in_use += 1;
            self.publish(&state);
            return Ok(self.lease(worker));
        }

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(Condvar::new());
        state.waiters.push_back(Waiter {
            id,
            signal: Arc::clone(&signal),
        });
        self.publish(&state);
        debug!(waiter = id, queued = state.waiters.len(), "Waiting for a worker");

        loop {
            if let Some(handoff) = state.handoffs.remove(&id) {
                return match handoff {
                    Handoff::Worker(worker) => Ok(self.lease(worker)),
                    Handoff::ShuttingDown => Err(PyPoolError::ShuttingDown),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                state.waiters.retain(|w| w.id != id);
                self.publish(&state);
                return Err(PyPoolError::PoolExhausted {
                    waited: start.elapsed(),
                });
            }

            state = signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Take an available worker without waiting. Never bypasses queued callers.
    fn try_acquire(self: &Arc<Self>) -> Option<WorkerLease> {
        let mut state = self.lock();
        if state.shutting_down || !state.waiters.is_empty() {
            return None;
        }
        let worker = state.available.pop_front()?;
        state.in_use += 1;
        self.publish(&state);
        Some(self.lease(worker))
    }

    /// Hand a worker to the first waiter, or park it as available.
    fn make_available(&self, state: &mut PoolState, mut worker: Worker) {
        if let Some(waiter) = state.waiters.pop_front() {
            worker.set_state(WorkerState::InUse);
            state.in_use += 1;
            state.handoffs.insert(waiter.id, Handoff::Worker(worker));
            waiter.signal.notify_one();
        } else {
            worker.set_state(WorkerState::Available);
            state.available.push_back(worker);
        }
    }

    /// Called from `WorkerLease::drop`.
    pub(crate) fn check_in(self: &Arc<Self>, mut worker: Worker) {
        let worker_id = worker.id();
        let discard_reason = if worker.is_unhealthy() {
            Some("unhealthy")
        } else {
            worker.drain_stale();
            if worker.is_unhealthy() {
                Some("output closed")
            } else if !worker.is_alive() {
                Some("process exited")
            } else if worker.consecutive_failures() >= self.config.max_consecutive_failures {
                Some("too many consecutive failures")
            } else {
                None
            }
        };
        let recycle = self
            .config
            .max_requests_per_worker
            .is_some_and(|max| worker.requests_served() >= max);

        let mut state = self.lock();
        state.in_use -= 1;

        let decision = if state.shutting_down {
            Release::Retire
        } else if discard_reason.is_some() {
            Release::Discard
        } else if state.retiring > 0 {
            state.retiring -= 1;
            Release::Retire
        } else if recycle {
            Release::Discard
        } else {
            Release::Return
        };

        match decision {
            Release::Return => {
                self.make_available(&mut state, worker);
                self.publish(&state);
            }
            Release::Retire => {
                state.live.remove(&worker_id);
                self.publish(&state);
                drop(state);
                debug!(worker_id, "Retiring worker");
                self.stop_in_background(vec![worker]);
            }
            Release::Discard => {
                state.live.remove(&worker_id);
                // A pending shrink absorbs the loss instead of a replacement.
                let replace = if state.retiring > 0 {
                    state.retiring -= 1;
                    false
                } else {
                    state.respawning += 1;
                    true
                };
                self.publish(&state);
                drop(state);

                match discard_reason {
                    Some(reason) => {
                        warn!(worker_id, reason, replace, "Discarding worker");
                        worker.kill();
                    }
                    None => {
                        debug!(
                            worker_id,
                            requests = worker.requests_served(),
                            "Recycling worker after request limit"
                        );
                        self.stop_in_background(vec![worker]);
                    }
                }
                if replace {
                    self.spawn_replacements(1);
                }
            }
        }
    }

    /// Start `count` replacement workers. The caller has already counted them
    /// in `respawning`.
    fn spawn_replacements(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("pypool-spawn-{}", id))
                .spawn(move || {
                    let result = Worker::spawn(id, &inner.spec);
                    inner.finish_spawn(id, result);
                });
            if let Err(e) = spawned {
                error!(worker_id = id, error = %e, "Failed to start spawn thread");
                let mut state = self.lock();
                state.respawning -= 1;
                self.publish(&state);
            }
        }
    }

    fn finish_spawn(&self, id: usize, result: Result<Worker>) {
        let mut state = self.lock();
        state.respawning -= 1;
        match result {
            Ok(worker) => {
                if state.shutting_down || state.retiring > 0 {
                    if !state.shutting_down {
                        state.retiring -= 1;
                    }
                    self.publish(&state);
                    drop(state);
                    debug!(worker_id = id, "Replacement no longer needed");
                    worker.kill();
                    return;
                }
                self.gauges.spawned.fetch_add(1, Ordering::Relaxed);
                self.gauges.replaced.fetch_add(1, Ordering::Relaxed);
                state.live.insert(id, worker.pid());
                self.make_available(&mut state, worker);
                self.publish(&state);
                drop(state);
                info!(worker_id = id, "Replacement worker ready");
            }
            Err(e) => {
                self.publish(&state);
                drop(state);
                warn!(
                    worker_id = id,
                    error = %e,
                    "Replacement worker failed to start; the next health check will retry"
                );
            }
        }
    }

    fn stop_in_background(&self, workers: Vec<Worker>) {
        if workers.is_empty() {
            return;
        }
        let grace = self.config.stop_grace;
        self.gauges
            .retired
            .fetch_add(workers.len() as u64, Ordering::Relaxed);
        for worker in workers {
            let worker_id = worker.id();
            let spawned = thread::Builder::new()
                .name(format!("pypool-stop-{}", worker_id))
                .spawn(move || {
                    worker.stop(grace);
                });
            if let Err(e) = spawned {
                // The worker was moved into the failed closure and dropped,
                // which terminates the process.
                warn!(worker_id, error = %e, "Failed to start stop thread");
            }
        }
    }

    /// Spawn workers until the pool is back at its target size.
    fn restore_size(self: &Arc<Self>) -> usize {
        let deficit = {
            let mut state = self.lock();
            if state.shutting_down {
                return 0;
            }
            let deficit = state.target_size.saturating_sub(state.effective_size());
            state.respawning += deficit;
            self.publish(&state);
            deficit
        };
        if deficit > 0 {
            info!(deficit, "Restoring pool size");
            self.spawn_replacements(deficit);
        }
        deficit
    }

    fn health_check(self: &Arc<Self>) -> HealthReport {
        let mut report = HealthReport::default();
        let candidates = self.gauges.available.load(Ordering::Acquire);
        for _ in 0..candidates {
            let Some(mut lease) = self.try_acquire() else {
                break;
            };
            report.probed += 1;
            if let Err(e) = lease.ping(self.config.probe_timeout) {
                report.failed += 1;
                warn!(worker_id = lease.worker_id(), error = %e, "Health probe failed");
            }
        }
        report.respawned = self.restore_size();
        debug!(
            probed = report.probed,
            failed = report.failed,
            respawned = report.respawned,
            "Health check complete"
        );
        report
    }

    fn resize(self: &Arc<Self>, new_size: usize) -> Result<()> {
        if new_size == 0 {
            return Err(PyPoolError::Configuration(
                "pool size must be at least 1".into(),
            ));
        }

        let (current, grow, to_stop, deferred) = {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(PyPoolError::ShuttingDown);
            }
            let current = state.effective_size();
            state.target_size = new_size;

            let mut grow = 0;
            let mut to_stop = Vec::new();
            let mut deferred = 0;
            if new_size > current {
                let needed = new_size - current;
                let cancelled = needed.min(state.retiring);
                state.retiring -= cancelled;
                grow = needed - cancelled;
                state.respawning += grow;
            } else if new_size < current {
                let mut excess = current - new_size;
                while excess > 0 {
                    let Some(worker) = state.available.pop_back() else {
                        break;
                    };
                    state.live.remove(&worker.id());
                    to_stop.push(worker);
                    excess -= 1;
                }
                state.retiring += excess;
                deferred = excess;
            }
            self.publish(&state);
            (current, grow, to_stop, deferred)
        };

        info!(
            from = current,
            to = new_size,
            spawning = grow,
            stopping = to_stop.len(),
            deferred,
            "Resizing worker pool"
        );
        self.spawn_replacements(grow);
        self.stop_in_background(to_stop);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state() -> PoolState {
        PoolState {
            available: VecDeque::new(),
            waiters: VecDeque::new(),
            handoffs: HashMap::new(),
            live: HashMap::new(),
            target_size: 3,
            in_use: 2,
            respawning: 1,
            retiring: 0,
            shutting_down: false,
        }
    }

    #[test]
    fn test_total_size_counts_respawning() {
        let state = empty_state();
        assert_eq!(state.total_size(), 3);
        assert_eq!(state.effective_size(), 3);
    }

    #[test]
    fn test_effective_size_subtracts_retiring() {
        let mut state = empty_state();
        state.retiring = 2;
        assert_eq!(state.total_size(), 3);
        assert_eq!(state.effective_size(), 1);

        state.retiring = 10;
        assert_eq!(state.effective_size(), 0);
    }

    #[test]
    fn test_pool_stats_serializes_camel_case() {
        let stats = PoolStats {
            total_size: 3,
            in_use: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["totalSize"], 3);
        assert_eq!(json["inUse"], 1);
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let result = WorkerPool::start(PoolConfig::default().with_size(0));
        assert!(matches!(result, Err(PyPoolError::Configuration(_))));
    }

    #[test]
    fn test_start_with_missing_interpreter_is_configuration_error() {
        let config = PoolConfig::default().with_interpreter("/nonexistent/bin/python3");
        let result = WorkerPool::start(config);
        assert!(matches!(result, Err(PyPoolError::Configuration(_))));
    }
}
