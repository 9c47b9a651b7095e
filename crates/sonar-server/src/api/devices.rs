//! Per-peer exchange statistics.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use sonar_core::{DeviceIdentity, DeviceStats};
use utoipa::ToSchema;

use crate::state::AppState;

/// Statistics of one logical peer.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "identity": "9f2c4e1a7b3d5c60",
    "success_count": 4,
    "failure_count": 1,
    "successive_failure_count": 0,
    "confidence": 3,
    "last_success_secs_ago": 12,
    "ignored": false
}))]
pub struct DeviceStatsView {
    /// Logical peer identity (hex).
    #[schema(example = "9f2c4e1a7b3d5c60")]
    pub identity: String,

    /// Successful exchanges.
    pub success_count: u32,

    /// Failed exchanges.
    pub failure_count: u32,

    /// Failures since the last success.
    pub successive_failure_count: u32,

    /// Successes minus failures.
    pub confidence: i64,

    /// Seconds since the last successful exchange.
    pub last_success_secs_ago: Option<u64>,

    /// Whether the peer is skipped (no exchange service).
    pub ignored: bool,
}

impl From<(DeviceIdentity, DeviceStats)> for DeviceStatsView {
    fn from((identity, stats): (DeviceIdentity, DeviceStats)) -> Self {
        Self {
            identity: identity.to_string(),
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            successive_failure_count: stats.successive_failure_count,
            confidence: stats.confidence_score(),
            last_success_secs_ago: stats.last_success_time.map(|at| at.elapsed().as_secs()),
            ignored: stats.should_ignore,
        }
    }
}

/// Device statistics response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DevicesResponse {
    /// Peers observed recently.
    pub devices: Vec<DeviceStatsView>,
}

/// List per-peer statistics.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "listDevices",
    summary = "List peer statistics",
    description = "Returns exchange statistics for every peer the engine \
        connected to recently. Peers that are no longer observed expire.",
    responses(
        (status = 200, description = "Peer statistics", body = DevicesResponse)
    )
)]
pub async fn list_devices(State(state): State<AppState>) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        devices: state
            .engine()
            .device_stats()
            .into_iter()
            .map(DeviceStatsView::from)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::server;

    #[tokio::test]
    async fn test_no_devices_before_start() {
        let (server, _) = server();
        let response: DevicesResponse = server.get("/api/devices").await.json();
        assert!(response.devices.is_empty());
    }

    #[test]
    fn test_view_from_stats() {
        let stats = DeviceStats {
            success_count: 3,
            failure_count: 5,
            should_ignore: true,
            ..DeviceStats::default()
        };
        let view = DeviceStatsView::from((DeviceIdentity(0xAB), stats));
        assert_eq!(view.identity, "00000000000000ab");
        assert_eq!(view.confidence, -2);
        assert!(view.ignored);
        assert_eq!(view.last_success_secs_ago, None);
    }
}
