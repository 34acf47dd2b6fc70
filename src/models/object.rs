//! Represents an object (file) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata of a single stored object.
///
/// The payload itself lives on disk; this is what the store reports back
/// after a put or compose and what listing and download read from.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Content type (MIME type) recorded at upload time.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 hex digest of the payload.
    pub etag: Option<String>,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,
}

impl ObjectInfo {
    /// Last path segment of the key, used as the download file name.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}
