//! The sonar OpenAPI document, served at `/api/openapi.json` and written to
//! disk by `gen-openapi`.

use axum::Json;
use sonar_core::StrategyKind;
use utoipa::OpenApi;

use super::devices::{DeviceStatsView, DevicesResponse};
use super::engine::EngineStatusResponse;
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::payload::{PayloadResponse, UpdatePayloadRequest};
use super::proximity::{ErrorsResponse, ProximityEventsResponse};
use crate::events::{ProximityEventView, ReportedError};

pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Main OpenAPI document structure for sonar.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "sonar API",
        version = "0.1.0",
        description = r#"
# sonar API

sonar runs a proximity exchange engine: it discovers nearby devices over a
short-range radio, exchanges a small rotating identity payload with them, and
reports calibrated signal strength.

## Overview

1. **Engine**: start and stop the engine, inspect radio health, rotate the identity payload
2. **Proximity**: recent detections and reported errors
3. **Devices**: per-peer exchange statistics

Signal strength is reported both raw and calibrated. Calibration removes the
transmit gain of the sender and the receive gain of the receiver so values are
comparable across device models.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local sonar server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks"
        ),
        (
            name = "engine",
            description = "Engine lifecycle, radio health and identity rotation"
        ),
        (
            name = "proximity",
            description = "Detected peers and engine errors"
        ),
        (
            name = "devices",
            description = "Per-peer exchange statistics"
        )
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // Engine endpoints
        super::engine::get_engine,
        super::engine::start_engine,
        super::engine::stop_engine,
        super::payload::update_payload,
        // Proximity endpoints
        super::proximity::list_events,
        super::proximity::list_errors,
        // Device endpoints
        super::devices::list_devices,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Engine types
            EngineStatusResponse,
            StrategyKind,
            UpdatePayloadRequest,
            PayloadResponse,
            // Proximity types
            ProximityEventView,
            ProximityEventsResponse,
            ReportedError,
            ErrorsResponse,
            // Device types
            DeviceStatsView,
            DevicesResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "sonar API");
        assert!(spec.paths.paths.contains_key("/api/engine/start"));
        assert!(spec.paths.paths.contains_key("/api/proximity"));
    }

    #[test]
    fn test_every_route_is_documented() {
        let spec = ApiDoc::openapi();
        for path in [
            "/health",
            "/api/engine",
            "/api/engine/stop",
            "/api/payload",
            "/api/errors",
            "/api/devices",
        ] {
            assert!(spec.paths.paths.contains_key(path), "{path} missing");
        }
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = ApiDoc::openapi().to_pretty_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"sonar API\""));
    }
}
