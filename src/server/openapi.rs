//! OpenAPI specification for the pypool API.

use utoipa::OpenApi;

use super::error::ApiErrorBody;
use super::handlers;
use super::types::*;
use crate::api::{Diagnostics, HealthStatus, PoolStatsView, VersionInfo};
use crate::coordinator::{ErrorInfo, ExecutionResponse};
use crate::error::ErrorKind;
use crate::metrics::MetricsSnapshot;
use crate::pool::{PoolStats, WorkerInfo};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "pypool API",
        description = "Run Python code on a pool of long-lived worker processes.",
        version = "1.0.0",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local server")
    ),
    paths(
        handlers::exec,
        handlers::eval,
        handlers::call_module,
        handlers::reset,
        handlers::get_version,
        handlers::list_modules,
        handlers::get_pool_stats,
        handlers::health_check,
        handlers::get_metrics,
        handlers::get_diagnostics,
    ),
    components(schemas(
        ExecBody,
        EvalBody,
        CallModuleBody,
        ResetResponse,
        ModulesResponse,
        ExecutionResponse,
        ErrorInfo,
        ErrorKind,
        ApiErrorBody,
        VersionInfo,
        PoolStatsView,
        PoolStats,
        WorkerInfo,
        HealthStatus,
        MetricsSnapshot,
        Diagnostics,
    )),
    tags(
        (name = "execution", description = "Run code on pooled workers"),
        (name = "info", description = "Interpreter information"),
        (name = "health", description = "Health checks"),
        (name = "monitoring", description = "Pool statistics and metrics")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_all_routes() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/v1/exec",
            "/api/v1/eval",
            "/api/v1/call-module",
            "/api/v1/reset",
            "/api/v1/version",
            "/api/v1/modules",
            "/api/v1/pool-stats",
            "/api/v1/health",
            "/api/v1/metrics",
            "/api/v1/diagnostics",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {}", path);
        }
    }

    #[test]
    fn test_openapi_serializes() {
        let json = ApiDoc::openapi().to_json().unwrap();
        assert!(json.contains("ExecutionResponse"));
    }
}
