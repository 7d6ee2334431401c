use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::session::StoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unsupported language")]
    UnsupportedLanguage,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Session not found")]
    SessionNotFound,
    #[error("Request body exceeds configured limit")]
    PayloadTooLarge,
    #[error("Session store unavailable")]
    StoreUnavailable,
    #[error("{1}")]
    Rejected(StatusCode, String),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedLanguage | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Rejected(status, _) => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "request failed");
        }
        let body = Json(ErrorBody {
            detail: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        Self::Rejected(value.status(), value.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(value: QueryRejection) -> Self {
        Self::Rejected(value.status(), value.body_text())
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Timeout(_) => Self::StoreUnavailable,
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_status_classes() {
        assert_eq!(AppError::UnsupportedLanguage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::SessionNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(StoreError::Timeout(5)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
