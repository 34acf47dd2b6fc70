use crate::services::{
    archive_extractor::ExtractionError, chunked_upload::UploadError, file_service::FileError,
    object_store::StoreError,
};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for handler errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } | StoreError::BucketNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidKey(_) | StoreError::InvalidBucketName { .. } => {
                StatusCode::BAD_REQUEST
            }
            StoreError::ComposeRejected(_) | StoreError::LengthMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            StoreError::Sqlx(_) | StoreError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Store(inner) => inner.into(),
            UploadError::InvalidUploadId(_) => AppError::bad_request(err.to_string()),
            UploadError::PartMissing { .. } => {
                AppError::new(StatusCode::NOT_FOUND, err.to_string())
            }
            UploadError::ComposeRejected(_) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
        }
    }
}

impl From<ExtractionError> for AppError {
    fn from(err: ExtractionError) -> Self {
        match &err {
            ExtractionError::Corrupt { .. } => AppError::bad_request(err.to_string()),
            ExtractionError::Store { source, .. } => {
                let status = if source.is_unavailable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::UNPROCESSABLE_ENTITY
                };
                AppError::new(status, err.to_string())
            }
            ExtractionError::Spool(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            ExtractionError::Aborted(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<FileError> for AppError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::InvalidFileName(_) => AppError::bad_request(err.to_string()),
            FileError::Store(inner) => inner.into(),
            FileError::Extraction(inner) => inner.into(),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}
