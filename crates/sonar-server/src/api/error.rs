//! API errors.
//!
//! Handlers return [`ApiResult`]. Engine errors convert through
//! `From<SonarError>`, which picks the HTTP status from the error class:
//!
//! | Engine error | Status |
//! |---|---|
//! | `AlreadyRunning`, `SessionBusy` | 409 |
//! | `NotSetUp` | 424 |
//! | `Config` | 500 |
//! | transport, timeout and radio health errors | 503 |

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use sonar_core::SonarError;
use utoipa::ToSchema;

pub type ApiResult<T> = Result<T, ApiError>;

/// An error response on its way out: a status plus its JSON body.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "DISCOVERY_START_FAILED",
    "message": "discovery failed to start (platform code 2)",
    "details": { "platform_code": 2, "subsystem": "discovery" }
}))]
pub struct ErrorResponse {
    /// Machine-readable code, e.g. `ALREADY_RUNNING` or `invalid_identity`.
    #[schema(example = "ALREADY_RUNNING")]
    pub error: String,

    pub message: String,

    /// Radio subsystem and platform code, for transport failures.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// 400 for input the handler rejected.
    pub fn bad_request(error_code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_code, message)
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

const fn status_for(err: &SonarError) -> StatusCode {
    match err {
        SonarError::AlreadyRunning | SonarError::SessionBusy(_) => StatusCode::CONFLICT,
        SonarError::NotSetUp => StatusCode::FAILED_DEPENDENCY,
        SonarError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SonarError::TransportStart { .. }
        | SonarError::TransportRuntime { .. }
        | SonarError::Timeout { .. }
        | SonarError::ServiceNotFound(_)
        | SonarError::RadioStackUnhealthy
        | SonarError::UnstablePlatform
        | SonarError::RadioExecutorStopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl From<SonarError> for ApiError {
    fn from(err: SonarError) -> Self {
        let mut api = Self::new(status_for(&err), err.error_code(), err.to_string());
        if let Some(subsystem) = err.subsystem() {
            api.body.details = Some(serde_json::json!({
                "subsystem": subsystem,
                "platform_code": err.platform_code(),
            }));
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(
                status = %self.status,
                error_code = %self.body.error,
                message = %self.body.message,
                "request failed"
            );
        }
        (self.status, Json(self.body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.body.message)
    }
}

impl std::error::Error for ApiError {}
