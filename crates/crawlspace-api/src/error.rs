//! API error type and HTTP response mapping.
//!
//! Every error leaves the service as `{"error": {"type": "<code>",
//! "message": "<human>"}}` with a stable machine-readable code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crawlspace_engine::EngineError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Wire shape of an error response.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// The `{"type", "message"}` envelope.
    pub error: ApiErrorDetail,
}

/// Stable error payload.
#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    /// Machine-readable code, e.g. `NOT_FOUND`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// HTTP API error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    /// 400 `VALIDATION`.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION", message)
    }

    /// 401 `UNAUTHENTICATED`.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", message)
    }

    /// 403 `UNAUTHORIZED`.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "UNAUTHORIZED", message)
    }

    /// 404 `NOT_FOUND`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// 409 `CONFLICT`.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// 500 `INTERNAL`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Returns the HTTP status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable code.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                error: ApiErrorDetail {
                    kind: self.kind.to_string(),
                    message: self.message,
                },
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::NotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", value.to_string())
            }
            EngineError::InvalidState { .. } => {
                Self::new(StatusCode::CONFLICT, "INVALID_STATE", value.to_string())
            }
            EngineError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "INVALID_TRANSITION", value.to_string())
            }
            EngineError::LockedByOther { .. } => {
                Self::new(StatusCode::CONFLICT, "LOCKED_BY_OTHER", value.to_string())
            }
            EngineError::NotLockOwner { .. } => {
                Self::new(StatusCode::CONFLICT, "NOT_LOCK_OWNER", value.to_string())
            }
            EngineError::Validation(_) => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION", value.to_string())
            }
            EngineError::Conflict { .. } => {
                Self::new(StatusCode::CONFLICT, "CONFLICT", value.to_string())
            }
            EngineError::PartialWrite { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PARTIAL_WRITE",
                value.to_string(),
            ),
            EngineError::Dependency { .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "DEPENDENCY_UNAVAILABLE",
                value.to_string(),
            ),
            EngineError::Internal { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", value.to_string())
            }
        }
    }
}

impl From<crawlspace_core::Error> for ApiError {
    fn from(value: crawlspace_core::Error) -> Self {
        ApiError::from(EngineError::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_wire_codes() {
        let cases = [
            (
                EngineError::not_found("run", "x"),
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
            (
                EngineError::invalid_state("nope"),
                StatusCode::CONFLICT,
                "INVALID_STATE",
            ),
            (
                EngineError::LockedByOther {
                    request_id: "r".into(),
                },
                StatusCode::CONFLICT,
                "LOCKED_BY_OTHER",
            ),
            (
                EngineError::NotLockOwner {
                    request_id: "r".into(),
                },
                StatusCode::CONFLICT,
                "NOT_LOCK_OWNER",
            ),
            (
                EngineError::Validation("bad".into()),
                StatusCode::BAD_REQUEST,
                "VALIDATION",
            ),
            (
                EngineError::dependency("down"),
                StatusCode::SERVICE_UNAVAILABLE,
                "DEPENDENCY_UNAVAILABLE",
            ),
        ];
        for (err, status, kind) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status(), status);
            assert_eq!(api.kind(), kind);
        }
    }
}
