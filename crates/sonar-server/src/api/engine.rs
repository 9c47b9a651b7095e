//! Engine lifecycle endpoints.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sonar_core::StrategyKind;
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::AppState;

/// Creates the engine router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_engine))
        .route("/start", post(start_engine))
        .route("/stop", post(stop_engine))
}

/// Engine status.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "running": true,
    "strategy": "broadcast",
    "healthy": true,
    "discovery_failures": 0,
    "window_len": 12,
    "window_failures": 1,
    "uptime_secs": 3600
}))]
pub struct EngineStatusResponse {
    /// Whether a strategy is running.
    #[schema(example = true)]
    pub running: bool,

    /// The strategy this platform runs.
    pub strategy: StrategyKind,

    /// Whether the radio stack is considered healthy.
    #[schema(example = true)]
    pub healthy: bool,

    /// Consecutive discovery start failures.
    #[schema(example = 0)]
    pub discovery_failures: u32,

    /// Exchange outcomes in the health window.
    #[schema(example = 12)]
    pub window_len: usize,

    /// Failed exchange outcomes in the health window.
    #[schema(example = 1)]
    pub window_failures: usize,

    /// Server uptime in seconds.
    #[schema(example = 3600)]
    pub uptime_secs: u64,
}

impl EngineStatusResponse {
    fn from_state(state: &AppState) -> Self {
        let engine = state.engine();
        let health = engine.health();
        Self {
            running: engine.is_running(),
            strategy: engine.strategy_kind(),
            healthy: !health.unhealthy,
            discovery_failures: health.discovery_failures,
            window_len: health.window_len,
            window_failures: health.window_failures,
            uptime_secs: state.uptime_secs(),
        }
    }
}

/// Get engine status.
#[utoipa::path(
    get,
    path = "/api/engine",
    tag = "engine",
    operation_id = "getEngine",
    summary = "Get engine status",
    description = "Returns whether the engine is running, which strategy the \
        platform uses, and the radio health counters.",
    responses(
        (status = 200, description = "Engine status", body = EngineStatusResponse)
    )
)]
pub async fn get_engine(State(state): State<AppState>) -> Json<EngineStatusResponse> {
    Json(EngineStatusResponse::from_state(&state))
}

/// Start the engine.
#[utoipa::path(
    post,
    path = "/api/engine/start",
    tag = "engine",
    operation_id = "startEngine",
    summary = "Start the engine",
    description = "Starts discovery and exchange with the strategy the platform \
        supports. Fails if the engine is already running.",
    responses(
        (status = 200, description = "Engine started", body = EngineStatusResponse),
        (status = 409, description = "Engine already running", body = super::error::ErrorResponse),
        (status = 424, description = "Engine not set up", body = super::error::ErrorResponse)
    )
)]
pub async fn start_engine(State(state): State<AppState>) -> ApiResult<Json<EngineStatusResponse>> {
    state.engine().start().await?;
    info!("engine started via API");
    Ok(Json(EngineStatusResponse::from_state(&state)))
}

/// Stop the engine.
#[utoipa::path(
    post,
    path = "/api/engine/stop",
    tag = "engine",
    operation_id = "stopEngine",
    summary = "Stop the engine",
    description = "Stops the running strategy and waits until every radio \
        session is closed. Stopping an idle engine succeeds.",
    responses(
        (status = 200, description = "Engine stopped", body = EngineStatusResponse),
        (status = 503, description = "Radio context unavailable", body = super::error::ErrorResponse)
    )
)]
pub async fn stop_engine(State(state): State<AppState>) -> ApiResult<Json<EngineStatusResponse>> {
    state.engine().stop().await?;
    info!("engine stopped via API");
    Ok(Json(EngineStatusResponse::from_state(&state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::server;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let (server, _) = server();

        let status: EngineStatusResponse = server.get("/api/engine").await.json();
        assert!(!status.running);
        assert_eq!(status.strategy, StrategyKind::Broadcast);
        assert!(status.healthy);

        let started = server.post("/api/engine/start").await;
        started.assert_status_ok();
        assert!(started.json::<EngineStatusResponse>().running);

        server
            .post("/api/engine/start")
            .await
            .assert_status(StatusCode::CONFLICT);

        let stopped = server.post("/api/engine/stop").await;
        stopped.assert_status_ok();
        assert!(!stopped.json::<EngineStatusResponse>().running);

        // Idempotent.
        server.post("/api/engine/stop").await.assert_status_ok();
    }
}
