//! HTTP-facing error type.
//!
//! Only hard validation failures and genuinely missing records reach callers
//! as 4xx. Ingestion never maps a downstream failure into this type once the
//! upload is stored locally; those become warnings and notifications.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::doc_service::ServiceError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("metadata extraction failed for {filename}: {reason}")]
    ExtractionFailed { filename: String, reason: String },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Self::ExtractionFailed { .. } => (StatusCode::BAD_GATEWAY, "extraction_failed"),
            Self::Service(_) => (StatusCode::BAD_GATEWAY, "upstream"),
            Self::Store(_) => (StatusCode::BAD_GATEWAY, "store"),
            Self::Io(_) | Self::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("{}: {}", code, self);
        }
        let body = json!({ "error": { "code": code, "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::validation("bad id").status_and_code().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::not_found("template", "x").status_and_code().0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::ExtractionFailed {
                filename: "a.pdf".into(),
                reason: "no json".into()
            }
            .status_and_code()
            .0,
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = AppError::not_found("job", "job_1");
        assert_eq!(err.to_string(), "job not found: job_1");
    }
}
