//! Defines routes for the file-manager API.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Files** (all addressed by a `path` within the configured bucket)
//!   - `POST   /api/files/upload`          — upload a file (zip archives are unpacked)
//!   - `POST   /api/files/upload/chunk`    — store one part of a chunked upload
//!   - `POST   /api/files/upload/complete` — assemble the parts
//!   - `GET    /api/files/list`            — one directory level
//!   - `GET    /api/files/download`        — stream an object
//!   - `DELETE /api/files`                 — delete an object

use crate::{
    handlers::{
        file_handlers::{
            complete_upload, delete_file, download_file, list_files, upload_chunk, upload_file,
        },
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router with `service` as shared state.
///
/// `max_upload_bytes` caps every request body, including multipart uploads.
pub fn routes(service: FileService, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/files", delete(delete_file))
        .route("/api/files/upload", post(upload_file))
        .route("/api/files/upload/chunk", post(upload_chunk))
        .route("/api/files/upload/complete", post(complete_upload))
        .route("/api/files/list", get(list_files))
        .route("/api/files/download", get(download_file))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(service)
}
