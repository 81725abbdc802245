//! HTTP API server for pypool.
//!
//! Exposes the [`ScriptApi`] boundary operations as JSON endpoints.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! pypool serve --port 8080 --workers 4
//!
//! # Evaluate an expression
//! curl -X POST localhost:8080/api/v1/eval -d '{"expression": "2 + 2"}' \
//!      -H 'content-type: application/json'
//!
//! # View API documentation
//! open "http://localhost:8080/docs"
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::api::ScriptApi;
use crate::error::Result;

/// Room for JSON escaping and envelope fields on top of the payload limit.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Shared application state.
pub struct AppState {
    pub api: Arc<ScriptApi>,
}

impl AppState {
    pub fn new(api: Arc<ScriptApi>) -> Self {
        Self { api }
    }
}

/// Server configuration.
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable CORS for all origins.
    pub cors: bool,
    /// Specific CORS origins (used when `cors` is false).
    pub cors_origins: Option<Vec<String>>,
}

/// Build the router: API routes under `/api/v1`, the OpenAPI document at
/// `/openapi.json`, interactive docs at `/docs`, request IDs and tracing.
pub fn build_router(state: Arc<AppState>, cors: Option<CorsLayer>) -> Router {
    let body_limit = state.api.executor().config().max_payload_bytes + BODY_LIMIT_SLACK;

    let api_routes = Router::new()
        .route("/exec", post(handlers::exec))
        .route("/eval", post(handlers::eval))
        .route("/call-module", post(handlers::call_module))
        .route("/reset", post(handlers::reset))
        .route("/version", get(handlers::get_version))
        .route("/modules", get(handlers::list_modules))
        .route("/pool-stats", get(handlers::get_pool_stats))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::get_metrics))
        .route("/diagnostics", get(handlers::get_diagnostics))
        .layer(DefaultBodyLimit::max(body_limit));

    let mut app = Router::new()
        .nest("/api/v1", api_routes)
        .merge(Scalar::with_url("/docs", openapi::ApiDoc::openapi()))
        .route(
            "/openapi.json",
            get(|| async { axum::Json(openapi::ApiDoc::openapi()) }),
        )
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(cors_layer) = cors {
        app = app.layer(cors_layer);
    }

    app
}

fn cors_layer(config: &ServerConfig) -> Option<CorsLayer> {
    let base = || {
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(Duration::from_secs(3600))
    };
    if config.cors {
        return Some(base().allow_origin(Any));
    }
    let origins: Vec<_> = config
        .cors_origins
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    (!origins.is_empty()).then(|| base().allow_origin(origins))
}

/// Serve the API until Ctrl+C.
///
/// The caller keeps ownership of the pool and shuts it down afterwards.
pub async fn run_server(config: ServerConfig, api: Arc<ScriptApi>) -> Result<()> {
    let state = Arc::new(AppState::new(api));
    let app = build_router(state, cors_layer(&config));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Starting pypool API server");
    eprintln!("pypool API server on http://{}", addr);
    eprintln!("API documentation: http://{}/docs", addr);
    eprintln!("OpenAPI spec: http://{}/openapi.json", addr);
    eprintln!();
    eprintln!("Press Ctrl+C to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    eprintln!("\nServer stopped");
    Ok(())
}

/// Resolve when the process receives Ctrl+C (SIGINT).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler; stop the server with a signal");
        std::future::pending::<()>().await;
    }
}
