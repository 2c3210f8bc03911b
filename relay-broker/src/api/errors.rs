//! API error types and their HTTP representation.
//!
//! Every error leaving the broker toward an external caller is rendered as
//! `{"error":{"message":…, "code":…}}` with a status from the fixed table in
//! the protocol. Messages carry no secret material at any severity.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_types::error_code::ErrorCode;
use relay_types::frame::ErrorPayload;
use serde_json::json;

use crate::services::router::RouteError;

/// All errors the external HTTP surface can answer with.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("model not found")]
    ModelNotFound,
    #[error("no connector available")]
    NoConnector,
    #[error("connector session lost")]
    SessionLost,
    #[error("deadline elapsed")]
    Timeout,
    #[error("request body of {len} bytes exceeds cap of {max} bytes")]
    BodyTooLarge { len: usize, max: usize },
    /// Terminal ERROR frame from the connector, passed through.
    #[error("{message}")]
    Relayed {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ApiError::ModelNotFound => StatusCode::NOT_FOUND,
            ApiError::NoConnector | ApiError::SessionLost => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Relayed { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn code(&self) -> ErrorCode {
        match self {
            ApiError::InvalidApiKey => ErrorCode::InvalidApiKey,
            ApiError::ModelNotFound => ErrorCode::ModelNotFound,
            ApiError::NoConnector => ErrorCode::NoConnector,
            ApiError::SessionLost => ErrorCode::SessionLost,
            ApiError::Timeout => ErrorCode::Timeout,
            ApiError::BodyTooLarge { .. } => ErrorCode::FrameTooLarge,
            ApiError::Relayed { code, .. } => *code,
            ApiError::Internal => ErrorCode::InternalError,
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(value: RouteError) -> Self {
        match value {
            RouteError::UnknownModel => ApiError::ModelNotFound,
            RouteError::NoConnector => ApiError::NoConnector,
        }
    }
}

impl From<ErrorPayload> for ApiError {
    fn from(value: ErrorPayload) -> Self {
        ApiError::Relayed {
            status: value.status,
            code: value.code,
            message: value.error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "code": self.code(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_not_found_matches_the_protocol_body() {
        let err = ApiError::ModelNotFound;
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "model not found");
        assert_eq!(err.code(), ErrorCode::ModelNotFound);
    }

    #[test]
    fn relayed_errors_keep_their_status_and_code() {
        let err = ApiError::from(ErrorPayload {
            status: 504,
            error: "upstream deadline elapsed".to_owned(),
            code: ErrorCode::Timeout,
        });
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[test]
    fn relayed_error_with_bogus_status_falls_back_to_502() {
        let err = ApiError::Relayed {
            status: 99,
            code: ErrorCode::LlmError,
            message: "upstream failed".to_owned(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
