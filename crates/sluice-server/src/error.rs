//! HTTP error type and its JSON payload.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use sluice_hub::HubError;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    /// Stable error code identifier.
    pub code: &'static str,
    pub message: String,
}

/// `{"error": {"code", "message"}}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown pipeline '{0}'")]
    UnknownPipeline(String),
    #[error("unknown job '{0}'")]
    UnknownJob(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownPipeline(_) | Self::UnknownJob(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownPipeline(_) => "unknown_pipeline",
            Self::UnknownJob(_) => "unknown_job",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ShuttingDown => "shutting_down",
            Self::Internal(_) => "internal_error",
        }
    }

    fn to_status_and_body(&self) -> (StatusCode, ErrorBody) {
        (
            self.status(),
            ErrorBody {
                error: ErrorDetail {
                    code: self.code(),
                    message: self.to_string(),
                },
            },
        )
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::ShuttingDown => Self::ShuttingDown,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.to_status_and_body();
        if status.is_server_error() {
            tracing::warn!(code = body.error.code, message = %body.error.message, "request failed");
        }
        (status, Json(body)).into_response()
    }
}
