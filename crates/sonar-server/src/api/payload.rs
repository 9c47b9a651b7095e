//! Identity payload rotation.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use sonar_core::PayloadSource;
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::settings::parse_identity;
use crate::state::AppState;

/// New identity payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "identity": "00112233445566778899aabbccddeeff"
}))]
pub struct UpdatePayloadRequest {
    /// 16 bytes, hex-encoded.
    #[schema(example = "00112233445566778899aabbccddeeff")]
    pub identity: String,
}

/// The identity now in use.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PayloadResponse {
    /// 16 bytes, hex-encoded.
    #[schema(example = "00112233445566778899aabbccddeeff")]
    pub identity: String,

    /// Whether a running broadcast picked it up.
    pub broadcast_restarted: bool,
}

/// Rotate the identity payload.
#[utoipa::path(
    put,
    path = "/api/payload",
    tag = "engine",
    operation_id = "updatePayload",
    summary = "Rotate the identity payload",
    description = "Replaces the identity the engine advertises and exchanges. \
        A running broadcast restarts with the new payload; exchanges pick it \
        up on their next session.",
    request_body = UpdatePayloadRequest,
    responses(
        (status = 200, description = "Payload updated", body = PayloadResponse),
        (status = 400, description = "Identity is not 16 hex-encoded bytes", body = super::error::ErrorResponse)
    )
)]
pub async fn update_payload(
    State(state): State<AppState>,
    Json(request): Json<UpdatePayloadRequest>,
) -> ApiResult<Json<PayloadResponse>> {
    let identity = parse_identity(&request.identity)
        .map_err(|err| ApiError::bad_request("invalid_identity", format!("{err:#}")))?;

    state.identity().set(identity);
    state.engine().notify_payload_updated(identity);
    info!("identity payload rotated");

    Ok(Json(PayloadResponse {
        identity: hex::encode(state.identity().current().as_bytes()),
        broadcast_restarted: state.engine().is_running()
            && state.engine().strategy_kind() == sonar_core::StrategyKind::Broadcast,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::server;
    use axum::http::StatusCode;
    use serde_json::json;
    use sonar_core::Payload;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rejects_bad_identity() {
        let (server, _) = server();
        let response = server
            .put("/api/payload")
            .json(&json!({ "identity": "abcd" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(response.text().contains("invalid_identity"));
    }

    #[tokio::test]
    async fn test_rotation_restarts_broadcast() {
        let (server, state) = server();
        server.post("/api/engine/start").await.assert_status_ok();

        let identity = "0f".repeat(16);
        let response: PayloadResponse = server
            .put("/api/payload")
            .json(&json!({ "identity": identity }))
            .await
            .json();
        assert!(response.broadcast_restarted);
        assert_eq!(response.identity, identity);

        let expected = Payload::new(parse_identity(&identity).unwrap(), 0).encode();
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.radio().broadcasting() != Some(expected.clone()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.post("/api/engine/stop").await.assert_status_ok();
    }
}
