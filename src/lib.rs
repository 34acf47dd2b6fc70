//! file-gateway: a file-manager style HTTP interface over a flat,
//! key-addressed object store.
//!
//! Chunked uploads, zip ingestion and directory listings are built on top of
//! the store's put/get/delete/compose/list primitives; see [`services`].

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use crate::services::{
    file_service::FileService, local_store::LocalObjectStore, store_client::StoreClient,
};
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;

/// Wire the local store, the client facade and the router for `cfg`.
///
/// Expects a migrated pool; creates the configured bucket if needed.
pub async fn build_app(cfg: &config::AppConfig, db: sqlx::SqlitePool) -> Result<Router> {
    let store = LocalObjectStore::new(Arc::new(db), cfg.storage_dir.clone())
        .with_max_compose_sources(cfg.max_compose_sources);
    let client = StoreClient::new(Arc::new(store), cfg.bucket.clone());
    client
        .ensure_bucket()
        .await
        .with_context(|| format!("preparing bucket `{}`", cfg.bucket))?;

    let service = FileService::new(client, cfg.max_entry_bytes);
    Ok(routes::routes::routes(service, cfg.max_upload_bytes))
}
