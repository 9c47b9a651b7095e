//! Recent proximity events and engine errors.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::events::{ProximityEventView, ReportedError};
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;

/// Query parameters for the listing endpoints.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct LimitQuery {
    /// Maximum number of entries, newest first. Defaults to 50.
    #[param(example = 20, minimum = 1)]
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Recent proximity events.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProximityEventsResponse {
    /// Events, newest first.
    pub events: Vec<ProximityEventView>,
}

/// Recent engine errors.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorsResponse {
    /// Errors, newest first.
    pub errors: Vec<ReportedError>,
}

/// List recent proximity events.
#[utoipa::path(
    get,
    path = "/api/proximity",
    tag = "proximity",
    operation_id = "listProximityEvents",
    summary = "List recent proximity events",
    description = "Returns the most recent peers the engine detected, with raw \
        and calibrated signal strength. Only a bounded number of events is kept.",
    params(LimitQuery),
    responses(
        (status = 200, description = "Recent events", body = ProximityEventsResponse)
    )
)]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<ProximityEventsResponse> {
    Json(ProximityEventsResponse {
        events: state.events().recent_events(query.limit()),
    })
}

/// List recent engine errors.
#[utoipa::path(
    get,
    path = "/api/errors",
    tag = "proximity",
    operation_id = "listErrors",
    summary = "List recent engine errors",
    description = "Returns the most recent errors the engine reported, tagged \
        with the radio subsystem and platform code. A fatal error means the \
        engine stopped and the radio stack needs a restart.",
    params(LimitQuery),
    responses(
        (status = 200, description = "Recent errors", body = ErrorsResponse)
    )
)]
pub async fn list_errors(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<ErrorsResponse> {
    Json(ErrorsResponse {
        errors: state.events().recent_errors(query.limit()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{server, wait_for_events};

    #[tokio::test]
    async fn test_events_from_simulated_peer() {
        let (server, state) = server();
        server.post("/api/engine/start").await.assert_status_ok();
        wait_for_events(&state, 3).await;

        let response: ProximityEventsResponse = server
            .get("/api/proximity")
            .add_query_param("limit", 2)
            .await
            .json();
        assert_eq!(response.events.len(), 2);
        assert_eq!(response.events[0].identity, "42".repeat(16));
        assert_eq!(response.events[0].raw_rssi, -58);
        assert_eq!(response.events[0].calibrated_rssi, -52);
        assert!(response.events[0].observed_at_utc >= response.events[1].observed_at_utc);

        server.post("/api/engine/stop").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_errors_listed() {
        let (server, state) = server();
        server.post("/api/engine/start").await.assert_status_ok();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !state.radio().inject_broadcast_error(Some(7)) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            while state.events().recent_errors(1).is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let response: ErrorsResponse = server.get("/api/errors").await.json();
        assert_eq!(response.errors[0].error_code, "BROADCAST_ERROR");
        assert_eq!(response.errors[0].platform_code, Some(7));
        assert!(!response.errors[0].fatal);

        server.post("/api/engine/stop").await.assert_status_ok();
    }
}
