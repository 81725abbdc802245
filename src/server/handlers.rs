//! API request handlers.
//!
//! Executions block a thread for as long as the script runs, so every handler
//! that talks to a worker goes through `tokio::task::spawn_blocking()`. The
//! executor enforces the acquire and per-call timeouts itself; no extra
//! timeout is layered on top here.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use std::sync::Arc;
use tracing::instrument;

use crate::api::{Diagnostics, HealthStatus, PoolStatsView, ScriptApi, VersionInfo};
use crate::coordinator::{ExecutionRequest, ExecutionResponse};
use crate::metrics::MetricsSnapshot;

use super::AppState;
use super::error::{ApiError, ApiErrorBody, status_for_kind};
use super::types::*;

/// Run a blocking call against the API on the blocking thread pool.
async fn run_blocking<T, F>(state: &AppState, operation: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&ScriptApi) -> T + Send + 'static,
{
    let api = Arc::clone(&state.api);
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(|| operation(&api)))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Blocking task panicked");
            ApiError::internal(format!("Task join error: {}", e))
        })
}

async fn execute(
    state: &AppState,
    request: ExecutionRequest,
) -> Result<(StatusCode, Json<ExecutionResponse>), ApiError> {
    let response = run_blocking(state, move |api| api.execute(&request)).await?;
    let status = response
        .error_kind()
        .map_or(StatusCode::OK, status_for_kind);
    Ok((status, Json(response)))
}

/// Run a block of statements on a pooled worker.
#[utoipa::path(
    post,
    path = "/api/v1/exec",
    request_body = ExecBody,
    responses(
        (status = 200, description = "Completed; check `success` for script errors", body = ExecutionResponse),
        (status = 400, description = "Malformed request", body = ApiErrorBody),
        (status = 403, description = "Denied by the module policy", body = ExecutionResponse),
        (status = 413, description = "Payload too large", body = ExecutionResponse),
        (status = 502, description = "Worker crashed or broke protocol", body = ExecutionResponse),
        (status = 503, description = "No worker available", body = ExecutionResponse),
        (status = 504, description = "Execution timed out", body = ExecutionResponse)
    ),
    tag = "execution"
)]
#[instrument(skip_all)]
pub async fn exec(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ExecBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ExecutionResponse>), ApiError> {
    let Json(body) = body?;
    execute(&state, body.into()).await
}

/// Evaluate an expression on a pooled worker.
#[utoipa::path(
    post,
    path = "/api/v1/eval",
    request_body = EvalBody,
    responses(
        (status = 200, description = "Completed; check `success` for script errors", body = ExecutionResponse),
        (status = 400, description = "Malformed request", body = ApiErrorBody),
        (status = 502, description = "Worker crashed or broke protocol", body = ExecutionResponse),
        (status = 503, description = "No worker available", body = ExecutionResponse),
        (status = 504, description = "Execution timed out", body = ExecutionResponse)
    ),
    tag = "execution"
)]
#[instrument(skip_all)]
pub async fn eval(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EvalBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ExecutionResponse>), ApiError> {
    let Json(body) = body?;
    execute(&state, body.into()).await
}

/// Call a module function on a pooled worker.
#[utoipa::path(
    post,
    path = "/api/v1/call-module",
    request_body = CallModuleBody,
    responses(
        (status = 200, description = "Completed; check `success` for script errors", body = ExecutionResponse),
        (status = 400, description = "Malformed request", body = ApiErrorBody),
        (status = 403, description = "Denied by the module policy", body = ExecutionResponse),
        (status = 502, description = "Worker crashed or broke protocol", body = ExecutionResponse),
        (status = 503, description = "No worker available", body = ExecutionResponse),
        (status = 504, description = "Execution timed out", body = ExecutionResponse)
    ),
    tag = "execution"
)]
#[instrument(skip_all)]
pub async fn call_module(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CallModuleBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ExecutionResponse>), ApiError> {
    let Json(body) = body?;
    execute(&state, body.into()).await
}

/// Clear the namespace of every idle worker.
#[utoipa::path(
    post,
    path = "/api/v1/reset",
    responses(
        (status = 200, description = "Reset summary", body = ResetResponse)
    ),
    tag = "execution"
)]
#[instrument(skip(state))]
pub async fn reset(State(state): State<Arc<AppState>>) -> Result<Json<ResetResponse>, ApiError> {
    let summary = run_blocking(&state, |api| api.reset()).await?;
    Ok(Json(summary.into()))
}

/// Interpreter version reported by a worker.
#[utoipa::path(
    get,
    path = "/api/v1/version",
    responses(
        (status = 200, description = "Version information", body = VersionInfo)
    ),
    tag = "info"
)]
#[instrument(skip(state))]
pub async fn get_version(State(state): State<Arc<AppState>>) -> Result<Json<VersionInfo>, ApiError> {
    let info = run_blocking(&state, |api| api.get_version()).await?;
    Ok(Json(info))
}

/// Installed distributions visible to the workers.
#[utoipa::path(
    get,
    path = "/api/v1/modules",
    responses(
        (status = 200, description = "Sorted distribution names", body = ModulesResponse),
        (status = 502, description = "Worker crashed or broke protocol", body = ApiErrorBody),
        (status = 503, description = "No worker available", body = ApiErrorBody),
        (status = 504, description = "Query timed out", body = ApiErrorBody)
    ),
    tag = "info"
)]
#[instrument(skip(state))]
pub async fn list_modules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ModulesResponse>, ApiError> {
    let modules = run_blocking(&state, |api| api.list_modules()).await??;
    Ok(Json(modules.into()))
}

/// Pool counters and execution statistics.
#[utoipa::path(
    get,
    path = "/api/v1/pool-stats",
    responses(
        (status = 200, description = "Pool statistics", body = PoolStatsView)
    ),
    tag = "monitoring"
)]
pub async fn get_pool_stats(State(state): State<Arc<AppState>>) -> Json<PoolStatsView> {
    Json(state.api.get_pool_stats())
}

/// Liveness of the pool.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Pool is healthy", body = HealthStatus),
        (status = 503, description = "No live workers or shutting down", body = HealthStatus)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthStatus>) {
    let health = state.api.get_health();
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// Full execution metrics.
#[utoipa::path(
    get,
    path = "/api/v1/metrics",
    responses(
        (status = 200, description = "Execution metrics", body = MetricsSnapshot)
    ),
    tag = "monitoring"
)]
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.api.metrics())
}

/// Availability, pool state, metrics, and alerts in one document.
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics report", body = Diagnostics)
    ),
    tag = "monitoring"
)]
#[instrument(skip(state))]
pub async fn get_diagnostics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Diagnostics>, ApiError> {
    let report = run_blocking(&state, |api| api.diagnostics()).await?;
    Ok(Json(report))
}
