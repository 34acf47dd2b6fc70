//! The object store contract consumed by the gateway.
//!
//! A bucket-scoped key to bytes store with no native hierarchy. Everything
//! the gateway needs from a backend is expressed by [`ObjectStore`]; the
//! bundled implementation is [`super::local_store::LocalObjectStore`].

use crate::models::object::ObjectInfo;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::{fmt, io};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Request body handed to [`ObjectStore::put`].
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("compose rejected: {0}")]
    ComposeRejected(String),
    #[error("declared length {declared} does not match received {received} bytes")]
    LengthMismatch { declared: u64, received: u64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True when the failure came from talking to the backing store rather
    /// than from the request itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Sqlx(_) | Self::Io(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One element of a prefix listing.
///
/// Non-recursive listings also return common sub-prefixes: those carry
/// `is_prefix = true`, a key ending in `/`, zero size and no timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreItem {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_prefix: bool,
}

impl StoreItem {
    pub fn object(info: &ObjectInfo) -> Self {
        Self {
            key: info.key.clone(),
            size: info.size_bytes.max(0) as u64,
            last_modified: Some(info.last_modified),
            is_prefix: false,
        }
    }

    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            last_modified: None,
            is_prefix: true,
        }
    }
}

/// An object opened for reading.
pub struct ObjectBody {
    pub info: ObjectInfo,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody").field("info", &self.info).finish()
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create `bucket` if it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str) -> StoreResult<()>;

    /// Store `body` under `key`, replacing any previous object.
    ///
    /// When `length` is given the received byte count must match it,
    /// otherwise nothing is stored.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
        content_type: Option<String>,
    ) -> StoreResult<ObjectInfo>;

    async fn get(&self, bucket: &str, key: &str) -> StoreResult<ObjectBody>;

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// Concatenate `sources`, in order, into a new object at `target`.
    ///
    /// Fails with `NotFound` naming the first missing source; in that case
    /// `target` is left untouched.
    async fn compose(
        &self,
        bucket: &str,
        target: &str,
        sources: &[String],
    ) -> StoreResult<ObjectInfo>;

    /// List keys starting with `prefix`, ordered by key.
    ///
    /// With `recursive = false` the listing stops at the next `/` after the
    /// prefix and returns each common sub-prefix once.
    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> StoreResult<Vec<StoreItem>>;

    /// Cheap round-trip used by the readiness probe.
    async fn ping(&self) -> StoreResult<()>;
}
