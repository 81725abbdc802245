//! Pool and executor configuration.
//!
//! Values come from defaults, then `PYPOOL_*` environment variables, then CLI
//! flags (which the binary applies last).
//!
//! # Environment Variables
//!
//! - `PYPOOL_POOL_SIZE` - Number of worker processes
//! - `PYPOOL_PYTHON` - Interpreter executable
//! - `PYPOOL_AUTO_PROVISION` - Download an interpreter when none is found (true/false)
//! - `PYPOOL_TIMEOUT_MS` - Default per-call timeout
//! - `PYPOOL_ACQUIRE_TIMEOUT_MS` - How long a caller waits for a free worker
//! - `PYPOOL_HEALTH_INTERVAL_SECS` - Health check interval (0 disables)
//! - `PYPOOL_ALLOWED_MODULES` - Comma separated module policy entries

use crate::coordinator::ModulePolicy;
use crate::error::{PyPoolError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of workers.
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Largest accepted request payload (code, expression, or serialized arguments).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes to keep running.
    pub size: usize,
    /// Interpreter executable (None = detect on the host).
    pub interpreter: Option<PathBuf>,
    /// Download a standalone interpreter when none can be found.
    pub auto_provision: bool,
    /// How long a new worker may take to complete its handshake.
    pub startup_timeout: Duration,
    /// Interval between health checks (zero disables the checker).
    pub health_check_interval: Duration,
    /// Timeout for a single health probe.
    pub probe_timeout: Duration,
    /// Consecutive failed calls after which a worker is replaced.
    pub max_consecutive_failures: u32,
    /// Recycle a worker after it has served this many requests.
    pub max_requests_per_worker: Option<u64>,
    /// Grace period for a worker to exit before it is signalled.
    pub stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            interpreter: None,
            auto_provision: false,
            startup_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_consecutive_failures: 5,
            max_requests_per_worker: None,
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Apply `PYPOOL_*` environment overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(size) = env_parse::<usize>("PYPOOL_POOL_SIZE") {
            self.size = size;
        }
        if let Ok(path) = std::env::var("PYPOOL_PYTHON")
            && !path.is_empty()
        {
            self.interpreter = Some(PathBuf::from(path));
        }
        if let Some(flag) = env_bool("PYPOOL_AUTO_PROVISION") {
            self.auto_provision = flag;
        }
        if let Some(secs) = env_parse::<u64>("PYPOOL_HEALTH_INTERVAL_SECS") {
            self.health_check_interval = Duration::from_secs(secs);
        }
        self
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(PyPoolError::Configuration(
                "pool size must be at least 1".into(),
            ));
        }
        if self.startup_timeout.is_zero() {
            return Err(PyPoolError::Configuration(
                "startup timeout must be non-zero".into(),
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(PyPoolError::Configuration(
                "probe timeout must be non-zero".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(PyPoolError::Configuration(
                "max consecutive failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the execution coordinator.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long a caller waits for a free worker.
    pub acquire_timeout: Duration,
    /// Per-call timeout when the request does not set one.
    pub default_timeout: Duration,
    /// Allow-list for CALL_MODULE (None = unrestricted).
    pub module_policy: Option<ModulePolicy>,
    /// Largest accepted payload in bytes.
    pub max_payload_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            default_timeout: Duration::from_secs(30),
            module_policy: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl ExecutorConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_module_policy(mut self, policy: ModulePolicy) -> Self {
        self.module_policy = Some(policy);
        self
    }

    /// Apply `PYPOOL_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_parse::<u64>("PYPOOL_TIMEOUT_MS") {
            self.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PYPOOL_ACQUIRE_TIMEOUT_MS") {
            self.acquire_timeout = Duration::from_millis(ms);
        }
        if let Ok(entries) = std::env::var("PYPOOL_ALLOWED_MODULES") {
            match ModulePolicy::parse(&entries) {
                Ok(policy) => self.module_policy = Some(policy),
                Err(e) => tracing::warn!(error = %e, "Ignoring PYPOOL_ALLOWED_MODULES"),
            }
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    parse_bool(&raw).or_else(|| {
        tracing::warn!(variable = name, value = %raw, "Ignoring unparseable flag");
        None
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
