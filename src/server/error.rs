//! API error handling.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{ErrorKind, PyPoolError};

/// API error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// Errors raised before a request reaches the executor.
///
/// Failures of the execution itself are reported as an `ExecutionResponse`
/// with a status from [`status_for_kind`], not as an `ApiError`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "PAYLOAD_TOO_LARGE".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::payload_too_large(rejection.body_text())
        } else {
            ApiError::bad_request(rejection.body_text())
        }
    }
}

impl From<PyPoolError> for ApiError {
    fn from(error: PyPoolError) -> Self {
        let status = match error.kind() {
            ErrorKind::ExecutionError => StatusCode::BAD_GATEWAY,
            kind => status_for_kind(kind),
        };
        let code = status
            .canonical_reason()
            .unwrap_or("ERROR")
            .to_ascii_uppercase()
            .replace(' ', "_");
        Self {
            status,
            code,
            message: error.to_string(),
        }
    }
}

/// HTTP status for a failed execution.
///
/// Script errors are a successful round trip and stay 200; the body's
/// `success: false` tells the caller what happened.
pub fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ExecutionError => StatusCode::OK,
        ErrorKind::PoolExhausted | ErrorKind::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::WorkerCrashed | ErrorKind::ProtocolError => StatusCode::BAD_GATEWAY,
        ErrorKind::PolicyViolation => StatusCode::FORBIDDEN,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_become_api_errors() {
        let err = ApiError::from(PyPoolError::ShuttingDown);
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "SERVICE_UNAVAILABLE");

        let err = ApiError::from(PyPoolError::Timeout {
            timeout: std::time::Duration::from_secs(1),
        });
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code, "GATEWAY_TIMEOUT");
    }

    #[test]
    fn test_script_errors_are_ok() {
        assert_eq!(status_for_kind(ErrorKind::ExecutionError), StatusCode::OK);
    }

    #[test]
    fn test_transport_status_codes() {
        assert_eq!(
            status_for_kind(ErrorKind::PoolExhausted),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_kind(ErrorKind::ShuttingDown),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for_kind(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for_kind(ErrorKind::WorkerCrashed), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for_kind(ErrorKind::ProtocolError), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for_kind(ErrorKind::PolicyViolation), StatusCode::FORBIDDEN);
        assert_eq!(status_for_kind(ErrorKind::InvalidRequest), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for_kind(ErrorKind::PayloadTooLarge),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_every_transport_kind_is_an_error_status() {
        for kind in ErrorKind::ALL {
            let status = status_for_kind(kind);
            assert_eq!(status.is_success(), !kind.is_transport(), "{}", kind);
        }
    }

    #[test]
    fn test_api_error_into_response() {
        let resp = ApiError::bad_request("missing field `code`").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
