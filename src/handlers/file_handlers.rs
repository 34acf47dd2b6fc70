//! HTTP handlers for the file-manager API under `/api/files`.
//!
//! Uploaded file bodies are piped straight into the store whenever the
//! target directory is already known; chunk payloads are small and are
//! buffered whole.

use crate::{
    errors::AppError,
    models::{listing::ListingEntry, object::ObjectInfo},
    services::{
        archive_extractor::SkippedEntry,
        file_service::{FileService, UploadOutcome},
        object_store::ByteStream,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Query, State, multipart::Field},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::{future::Future, io};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

/// `?path=` query used by list, download, delete and (optionally) upload.
#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub message: String,
    pub upload_id: String,
    pub part_number: u32,
    pub size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub message: String,
    pub object: ObjectInfo,
    pub part_count: usize,
    pub cleanup_failures: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// `POST /api/files/upload` — multipart `file` + `path`.
///
/// `.zip` files are unpacked into individual objects.
pub async fn upload_file(
    State(service): State<FileService>,
    Query(query): Query<PathQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut dir = query.path;
    let mut buffered: Option<(String, Option<String>, Bytes)> = None;
    let mut outcome = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "path" => {
                let value = field.text().await?;
                if dir.is_none() {
                    dir = Some(value);
                }
            }
            "file" if outcome.is_none() && buffered.is_none() => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().map(str::to_string);
                match dir.as_deref() {
                    Some(dir) => {
                        let (body, pump) = pipe_field(field);
                        let (_, result) = tokio::join!(
                            pump,
                            service.upload_file(dir, &file_name, body, content_type)
                        );
                        outcome = Some(result?);
                    }
                    // The directory arrives after the file; hold the bytes.
                    None => buffered = Some((file_name, content_type, field.bytes().await?)),
                }
            }
            _ => {}
        }
    }

    if let Some((file_name, content_type, bytes)) = buffered {
        let dir = dir.unwrap_or_default();
        let body: ByteStream = stream::once(async move { Ok::<_, io::Error>(bytes) }).boxed();
        outcome = Some(
            service
                .upload_file(&dir, &file_name, body, content_type)
                .await?,
        );
    }

    let response = match outcome.ok_or_else(|| AppError::bad_request("missing `file` field"))? {
        UploadOutcome::Stored(info) => UploadResponse {
            message: "File uploaded successfully".into(),
            key: info.key,
            size: Some(info.size_bytes),
            written: None,
            skipped: Vec::new(),
        },
        UploadOutcome::Extracted { prefix, report } => UploadResponse {
            message: "Archive extracted successfully".into(),
            key: prefix,
            size: None,
            written: Some(report.written),
            skipped: report.skipped,
        },
    };
    Ok(Json(response))
}

/// `POST /api/files/upload/chunk` — multipart `chunk`, `uploadId`,
/// `partNumber`, `path`.
pub async fn upload_chunk(
    State(service): State<FileService>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let mut chunk = None;
    let mut upload_id = None;
    let mut part_number = None;
    let mut path = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => chunk = Some(field.bytes().await?),
            "uploadId" => upload_id = Some(field.text().await?),
            "partNumber" => part_number = Some(parse_part_number(&field.text().await?)?),
            "path" => path = Some(field.text().await?),
            _ => {}
        }
    }

    let chunk = require(chunk, "chunk")?;
    let upload_id = require(upload_id, "uploadId")?;
    let part_number = require(part_number, "partNumber")?;
    let path = require(path, "path")?;

    let info = service
        .uploads
        .upload_chunk(&upload_id, part_number, chunk, &path)
        .await?;

    Ok(Json(ChunkResponse {
        message: "Chunk uploaded successfully".into(),
        upload_id,
        part_number,
        size: info.size_bytes,
    }))
}

/// `POST /api/files/upload/complete` — multipart `uploadId`, `path`,
/// `partNumbers` (repeated and/or comma-separated, in final byte order).
pub async fn complete_upload(
    State(service): State<FileService>,
    mut multipart: Multipart,
) -> Result<Json<CompleteResponse>, AppError> {
    let mut upload_id = None;
    let mut path = None;
    let mut part_numbers = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "uploadId" => upload_id = Some(field.text().await?),
            "path" => path = Some(field.text().await?),
            "partNumbers" => {
                for raw in field.text().await?.split(',') {
                    let raw = raw.trim();
                    if !raw.is_empty() {
                        part_numbers.push(parse_part_number(raw)?);
                    }
                }
            }
            _ => {}
        }
    }

    let upload_id = require(upload_id, "uploadId")?;
    let path = require(path, "path")?;

    let completed = service
        .uploads
        .complete_upload(&upload_id, &path, &part_numbers)
        .await?;

    let cleanup_failures = completed
        .cleanup
        .map(|partial| partial.failures.into_iter().map(|f| f.key).collect())
        .unwrap_or_default();

    Ok(Json(CompleteResponse {
        message: "Upload completed successfully".into(),
        object: completed.object,
        part_count: completed.part_count,
        cleanup_failures,
    }))
}

/// `GET /api/files/list?path=` — one directory level.
pub async fn list_files(
    State(service): State<FileService>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<ListingEntry>>, AppError> {
    let prefix = query.path.unwrap_or_default();
    Ok(Json(service.listing.list(&prefix).await?))
}

/// `GET /api/files/download?path=` — stream the object as an attachment.
pub async fn download_file(
    State(service): State<FileService>,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    let key = require(query.path, "path")?;
    let object = service.download(&key).await?;
    let body = Body::from_stream(ReaderStream::new(object.reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &object.info);
    Ok(response)
}

/// `DELETE /api/files?path=`
pub async fn delete_file(
    State(service): State<FileService>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, AppError> {
    let key = require(query.path, "path")?;
    service.delete(&key).await?;
    Ok(Json(MessageResponse {
        message: "File deleted successfully".into(),
    }))
}

/// Turn a multipart field into a `'static` byte stream.
///
/// The returned future copies the field into the stream and must be polled
/// alongside whatever consumes the stream.
fn pipe_field<'a>(mut field: Field<'a>) -> (ByteStream, impl Future<Output = ()> + 'a) {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    let pump = async move {
        loop {
            let item = match field.chunk().await {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => break,
                Err(err) => Err(io::Error::other(err)),
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    };
    (body, pump)
}

fn parse_part_number(raw: &str) -> Result<u32, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid part number `{}`", raw)))
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::bad_request(format!("missing `{}` field", field)))
}

fn set_download_headers(headers: &mut HeaderMap, meta: &ObjectInfo) {
    let content_type = meta
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );

    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.file_name().replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
