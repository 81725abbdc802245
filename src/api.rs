//! Function-call boundary.
//!
//! [`ScriptApi`] is what a host embeds: it owns the pool, the executor and
//! the metrics, and shapes their state into the boundary views the HTTP
//! server also returns.

use crate::config::{ExecutorConfig, PoolConfig};
use crate::coordinator::{ExecutionRequest, ExecutionResponse, Executor, ResetSummary};
use crate::error::Result;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::pool::{PoolStats, WorkerInfo, WorkerPool};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use utoipa::ToSchema;

/// Interpreter version as seen by the workers.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// e.g. `3.11.6`; absent when no worker answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub available: bool,
    /// Full version report from the worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
}

/// Pool counters combined with execution metrics.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatsView {
    pub total_size: usize,
    pub available: usize,
    pub in_use: usize,
    pub healthy: usize,
    pub respawning: usize,
    pub target_size: usize,
    pub waiting: usize,
    pub total_executions: u64,
    pub success_rate: f64,
    /// Rolling average.
    pub avg_execution_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct HealthStatus {
    pub healthy: bool,
}

/// Everything an operator needs to tell why calls are failing.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub healthy: bool,
    pub shutting_down: bool,
    pub interpreter: String,
    pub python: VersionInfo,
    pub pypool_version: String,
    pub pool: PoolStats,
    /// Workers idle at the time of the report.
    pub idle_workers: Vec<WorkerInfo>,
    pub metrics: MetricsSnapshot,
    pub alerts: Vec<String>,
}

/// Embedding surface over a running worker pool.
pub struct ScriptApi {
    executor: Executor,
}

impl ScriptApi {
    /// Start a pool and wrap it.
    pub fn start(pool_config: PoolConfig, executor_config: ExecutorConfig) -> Result<Self> {
        let pool = Arc::new(WorkerPool::start(pool_config)?);
        Ok(Self::new(pool, executor_config))
    }

    pub fn new(pool: Arc<WorkerPool>, executor_config: ExecutorConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        Self {
            executor: Executor::new(pool, metrics, executor_config),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn pool(&self) -> &WorkerPool {
        self.executor.pool()
    }

    /// Run a block of statements. `result` (or the new public names) comes back.
    pub fn exec(
        &self,
        code: &str,
        variables: Map<String, Value>,
        timeout_ms: Option<u64>,
    ) -> ExecutionResponse {
        let mut request = ExecutionRequest::exec(code).with_variables(variables);
        if let Some(ms) = timeout_ms {
            request = request.with_timeout(Duration::from_millis(ms));
        }
        self.executor.execute(&request)
    }

    pub fn eval(&self, expression: &str, variables: Map<String, Value>) -> ExecutionResponse {
        self.executor
            .execute(&ExecutionRequest::eval(expression).with_variables(variables))
    }

    pub fn call_module(&self, module: &str, function: &str, args: Vec<Value>) -> ExecutionResponse {
        self.executor
            .execute(&ExecutionRequest::call_module(module, function, args))
    }

    /// Run a fully specified request.
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResponse {
        self.executor.execute(request)
    }

    pub fn get_version(&self) -> VersionInfo {
        match self.executor.version() {
            Ok(details) => VersionInfo {
                version: details
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                available: true,
                details: Some(details),
            },
            Err(e) => {
                warn!(error = %e, "Version query failed");
                VersionInfo {
                    version: None,
                    available: false,
                    details: None,
                }
            }
        }
    }

    /// Installed distributions visible to the worker interpreter, sorted.
    pub fn list_modules(&self) -> Result<Vec<String>> {
        self.executor.list_modules()
    }

    pub fn get_pool_stats(&self) -> PoolStatsView {
        let pool = self.pool().stats();
        let metrics = self.executor.metrics();
        PoolStatsView {
            total_size: pool.total_size,
            available: pool.available,
            in_use: pool.in_use,
            healthy: pool.healthy,
            respawning: pool.respawning,
            target_size: pool.target_size,
            waiting: pool.waiting,
            total_executions: metrics.total_executions(),
            success_rate: metrics.success_rate(),
            avg_execution_time_ms: metrics.rolling_avg_ms(),
        }
    }

    /// Healthy while the pool is running and has at least one live worker.
    pub fn get_health(&self) -> HealthStatus {
        HealthStatus {
            healthy: !self.pool().is_shutting_down() && self.pool().stats().healthy > 0,
        }
    }

    /// Clear the namespace of every idle worker.
    pub fn reset(&self) -> ResetSummary {
        self.executor.reset_workers()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.executor.metrics().snapshot()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let pool = self.pool().stats();
        let metrics = self.metrics();
        let python = self.get_version();

        let mut alerts = metrics.alerts.clone();
        if pool.available == 0 && pool.waiting > 0 {
            alerts.push(format!(
                "Pool saturated: {} callers waiting for {} workers",
                pool.waiting, pool.total_size
            ));
        }
        if pool.total_size < pool.target_size {
            alerts.push(format!(
                "Pool below target size: {} of {} workers",
                pool.total_size, pool.target_size
            ));
        }

        Diagnostics {
            healthy: self.get_health().healthy,
            shutting_down: self.pool().is_shutting_down(),
            interpreter: self.pool().interpreter().display().to_string(),
            python,
            pypool_version: crate::version::full_version(),
            pool,
            idle_workers: self.pool().idle_workers(),
            metrics,
            alerts,
        }
    }

    pub fn resize(&self, size: usize) -> Result<()> {
        self.pool().resize(size)
    }

    pub fn shutdown(&self) {
        self.pool().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_info_skips_missing_fields() {
        let info = VersionInfo {
            version: None,
            available: false,
            details: None,
        };
        assert_eq!(serde_json::to_value(&info).unwrap(), json!({"available": false}));
    }

    #[test]
    fn test_pool_stats_view_field_names() {
        let view = PoolStatsView {
            total_size: 3,
            available: 2,
            in_use: 1,
            healthy: 3,
            respawning: 0,
            target_size: 3,
            waiting: 0,
            total_executions: 100,
            success_rate: 1.0,
            avg_execution_time_ms: 1.5,
        };
        let json = serde_json::to_value(&view).unwrap();
        for key in [
            "totalSize",
            "available",
            "inUse",
            "healthy",
            "totalExecutions",
            "successRate",
            "avgExecutionTimeMs",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }
}
