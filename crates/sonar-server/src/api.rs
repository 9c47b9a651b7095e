//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `health` - Service health checks
//! - `engine` - Engine lifecycle and status
//! - `payload` - Identity payload rotation
//! - `proximity` - Recent proximity events and engine errors
//! - `devices` - Per-peer statistics
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod devices;
pub mod engine;
pub mod error;
pub mod health;
pub mod openapi;
pub mod payload;
pub mod proximity;

pub use error::{ApiError, ApiResult, ErrorResponse};

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /engine            - Status, start, stop
/// ├── /payload           - Identity rotation
/// ├── /proximity         - Recent proximity events
/// ├── /errors            - Recent engine errors
/// ├── /devices           - Per-peer statistics
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .nest("/engine", engine::router())
                .route("/payload", put(payload::update_payload))
                .route("/proximity", get(proximity::list_events))
                .route("/errors", get(proximity::list_errors))
                .route("/devices", get(devices::list_devices))
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}
