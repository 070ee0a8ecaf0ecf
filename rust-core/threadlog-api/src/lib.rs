// SPDX-License-Identifier: PMPL-1.0-or-later
//! ThreadLog API
//!
//! HTTP surface for the ThreadLog conversation store.
//! Exposes the tool-invocation contract at `POST /tools/call`.

pub mod tools;

use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

use threadlog_store::LogStore;

pub use tools::{tool_catalog, ToolContent, ToolError, ToolRequest, ToolResponse, ToolRouter, ToolSpec};

/// API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ApiConfig {
    /// Defaults overlaid with `THREADLOG_HOST` and `THREADLOG_PORT`.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup("THREADLOG_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("THREADLOG_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| ApiError::Config(format!("THREADLOG_PORT is not a port: {port}")))?;
        }
        Ok(config)
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub router: ToolRouter,
}

impl AppState {
    pub fn new(store: LogStore) -> Self {
        Self {
            start_time: Instant::now(),
            router: ToolRouter::new(store),
        }
    }
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        // Tool contract
        .route("/tools", get(list_tools_handler))
        .route("/tools/call", post(call_tool_handler))
        .with_state(state)
}

/// Health check handler
#[instrument(skip(state))]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// Ready once the data directory answers a stats query.
#[instrument(skip(state))]
async fn ready_handler(State(state): State<AppState>) -> StatusCode {
    match state.router.store().stats().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Store not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn list_tools_handler() -> Json<Vec<ToolSpec>> {
    Json(tool_catalog())
}

/// Tool invocation handler. Store failures come back as 200 with
/// `success: false`; only an unparseable request is a 400.
#[instrument(skip(state, body))]
async fn call_tool_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ToolResponse>, ApiError> {
    let request: ToolRequest =
        serde_json::from_value(body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(state.router.call(request).await))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Start the API server
pub async fn serve(config: ApiConfig, store: LogStore) -> Result<(), std::io::Error> {
    let app = build_router(AppState::new(store));

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting ThreadLog API server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
