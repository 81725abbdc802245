//! pypool - pooled Python worker processes.
//!
//! A fixed set of long-lived interpreter processes is kept warm and fed
//! requests over a JSON-lines protocol on their stdin/stdout. Callers submit
//! [`ExecutionRequest`]s through an [`Executor`] (or the [`ScriptApi`]
//! facade) and always get an [`ExecutionResponse`] back, whether the script
//! raised, the worker died, or the pool had no capacity.
//!
//! ```no_run
//! use pypool::{ExecutorConfig, PoolConfig, ScriptApi};
//! use serde_json::Map;
//!
//! let api = ScriptApi::start(PoolConfig::default(), ExecutorConfig::default())?;
//! let response = api.eval("2 + 2", Map::new());
//! assert_eq!(response.result, Some(serde_json::json!(4)));
//! api.shutdown();
//! # Ok::<(), pypool::PyPoolError>(())
//! ```

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod interpreter;
pub mod logging;
pub mod metrics;
pub mod paths;
pub mod pool;
pub mod server;
pub mod version;
pub mod worker;

pub use api::ScriptApi;
pub use config::{ExecutorConfig, PoolConfig};
pub use coordinator::{
    ErrorInfo, ExecutionRequest, ExecutionResponse, Executor, ModulePolicy, Operation,
};
pub use error::{ErrorKind, PyPoolError, Result};
pub use metrics::MetricsCollector;
pub use pool::{PoolStats, WorkerInfo, WorkerLease, WorkerPool};
