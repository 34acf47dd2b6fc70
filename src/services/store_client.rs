//! Object store client facade.
//!
//! Binds an [`ObjectStore`] to the configured bucket so the components above
//! it never handle bucket names. No business logic lives here.

use crate::{
    models::object::ObjectInfo,
    services::object_store::{ByteStream, ObjectBody, ObjectStore, StoreItem, StoreResult},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::sync::Arc;

#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl StoreClient {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn ensure_bucket(&self) -> StoreResult<()> {
        self.store.ensure_bucket(&self.bucket).await
    }

    pub async fn put(
        &self,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
        content_type: Option<String>,
    ) -> StoreResult<ObjectInfo> {
        self.store
            .put(&self.bucket, key, body, length, content_type)
            .await
    }

    /// Put an in-memory payload with its exact length.
    pub async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: Option<String>,
    ) -> StoreResult<ObjectInfo> {
        let length = bytes.len() as u64;
        let body: ByteStream =
            stream::once(async move { Ok::<_, std::io::Error>(bytes) }).boxed();
        self.put(key, body, Some(length), content_type).await
    }

    pub async fn get(&self, key: &str) -> StoreResult<ObjectBody> {
        self.store.get(&self.bucket, key).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.store.delete(&self.bucket, key).await
    }

    pub async fn compose(&self, target: &str, sources: &[String]) -> StoreResult<ObjectInfo> {
        self.store.compose(&self.bucket, target, sources).await
    }

    pub async fn list_prefix(&self, prefix: &str, recursive: bool) -> StoreResult<Vec<StoreItem>> {
        self.store.list_prefix(&self.bucket, prefix, recursive).await
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.store.ping().await
    }
}
