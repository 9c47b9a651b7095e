//! Liveness probe.
//!
//! `/health` answers as long as the daemon serves requests. The `status`
//! field degrades when the radio stack is unhealthy so supervisors can decide
//! to restart the radio without scraping `/api/engine`.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::AppState;

const STATUS_OK: &str = "ok";
const STATUS_DEGRADED: &str = "degraded";

/// Daemon liveness.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "engine_running": true,
    "radio_healthy": true
}))]
pub struct HealthResponse {
    /// `ok`, or `degraded` while the radio stack is unhealthy.
    #[schema(example = "ok")]
    pub status: String,

    #[schema(example = "0.1.0")]
    pub version: String,

    pub engine_running: bool,

    pub radio_healthy: bool,
}

impl HealthResponse {
    fn probe(state: &AppState) -> Self {
        let engine = state.engine();
        let radio_healthy = !engine.health().unhealthy;
        Self {
            status: if radio_healthy { STATUS_OK } else { STATUS_DEGRADED }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            engine_running: engine.is_running(),
            radio_healthy,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Probe daemon liveness",
    description = "Always 200 while the daemon serves requests. `status` is \
        `degraded` when discovery keeps failing or too many recent exchanges \
        failed; see `/api/engine` for the counters behind it.",
    responses(
        (status = 200, description = "Daemon is alive", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::probe(&state))
}
