//! src/services/local_store.rs
//!
//! LocalObjectStore: the bundled [`ObjectStore`] backend. Object metadata
//! lives in SQLite; payloads live on local disk under
//! `base_path/{bucket}/{shard}/{shard}/{md5(bucket/key)}`. Addressing payloads
//! by digest keeps `a/b` and `a/b/c` from colliding on disk even though the
//! gateway happily stores both.

use crate::{
    models::{bucket::Bucket, object::ObjectInfo},
    services::object_store::{
        ByteStream, ObjectBody, ObjectStore, StoreError, StoreItem, StoreResult,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
/// Same ceiling MinIO and S3 apply to compose / multipart part counts.
pub const DEFAULT_MAX_COMPOSE_SOURCES: usize = 10_000;
pub const DEFAULT_LIST_PAGE_SIZE: i64 = 1000;

const OBJECT_COLUMNS: &str = "key, content_type, size_bytes, etag, last_modified";

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    max_compose_sources: usize,
    list_page_size: i64,
}

/// A fully written temporary payload waiting to be committed.
struct StagedPayload {
    tmp_path: PathBuf,
    size_bytes: i64,
    etag: String,
}

impl LocalObjectStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            max_compose_sources: DEFAULT_MAX_COMPOSE_SOURCES,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }

    pub fn with_max_compose_sources(mut self, max: usize) -> Self {
        self.max_compose_sources = max;
        self
    }

    /// Rows fetched per metadata query while listing.
    pub fn with_list_page_size(mut self, rows: usize) -> Self {
        self.list_page_size = rows.max(1) as i64;
        self
    }

    /// Reject keys that are empty, too long, absolute, contain a `..`
    /// segment, or carry control characters and backslashes.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        let invalid = || Err(StoreError::InvalidKey(key.to_string()));
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return invalid();
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return invalid();
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return invalid();
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> StoreResult<()> {
        let reject = |reason: &str| {
            Err(StoreError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.into(),
            })
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return reject("must be between 3 and 63 characters");
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return reject("allowed characters are lowercase letters, digits, dots, and hyphens");
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return reject("must start and end with a lowercase letter or digit");
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return reject("cannot contain consecutive dots or dot-hyphen combinations");
        }
        if is_ipv4_like(name) {
            return reject("must not be formatted like an IP address");
        }
        Ok(())
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Construct the payload path for a key: two shard levels taken from
    /// MD5(bucket/key), then the full digest as file name.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        let mut path = self.bucket_root(bucket_name);
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}", digest));
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> StoreResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::BucketNotFound(bucket.to_string()),
                other => StoreError::Sqlx(other),
            })
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StoreResult<ObjectInfo> {
        sqlx::query_as::<_, ObjectInfo>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE key = ? AND bucket_id = ?"
        ))
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                key: key.to_string(),
            },
            other => StoreError::Sqlx(other),
        })
    }

    /// Stream `body` into a temporary file next to `file_path`, computing
    /// size and MD5 on the way. The temporary file is removed on any error.
    async fn stage_payload(
        &self,
        file_path: &Path,
        body: ByteStream,
    ) -> StoreResult<StagedPayload> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = create_file_in(&parent, &tmp_path).await?;

        match write_stream(file, body).await {
            Ok((size_bytes, etag)) => Ok(StagedPayload {
                tmp_path,
                size_bytes,
                etag,
            }),
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(StoreError::Io(err))
            }
        }
    }

    /// Move a staged payload into place and upsert its metadata row
    /// (S3-like overwrite semantics).
    ///
    /// A payload being replaced keeps a second link until the row is
    /// committed, so a failed upsert puts the previous object back.
    async fn commit(
        &self,
        bucket: &Bucket,
        key: &str,
        file_path: &Path,
        staged: StagedPayload,
        content_type: Option<String>,
    ) -> StoreResult<ObjectInfo> {
        let backup = file_path.with_file_name(format!(".prev-{}", Uuid::new_v4()));
        let previous = match fs::hard_link(file_path, &backup).await {
            Ok(()) => Some(backup),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                let _ = fs::remove_file(&staged.tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };

        if let Err(err) = replace_file(&staged.tmp_path, file_path).await {
            let _ = fs::remove_file(&staged.tmp_path).await;
            if let Some(previous) = &previous {
                let _ = fs::remove_file(previous).await;
            }
            return Err(StoreError::Io(err));
        }

        let insert_result = sqlx::query_as::<_, ObjectInfo>(&format!(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes, etag, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(bucket.id)
        .bind(key)
        .bind(content_type)
        .bind(staged.size_bytes)
        .bind(&staged.etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(info) => {
                if let Some(previous) = previous {
                    if let Err(err) = fs::remove_file(&previous).await {
                        debug!(
                            "failed to remove replaced payload {}: {}",
                            previous.display(),
                            err
                        );
                    }
                }
                Ok(info)
            }
            Err(err) => {
                restore_previous(previous.as_deref(), file_path).await;
                Err(StoreError::Sqlx(err))
            }
        }
    }

    /// Recursively remove empty shard directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        fs::create_dir_all(self.bucket_root(bucket)).await?;
        sqlx::query(
            "INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(bucket)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
        content_type: Option<String>,
    ) -> StoreResult<ObjectInfo> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let file_path = self.object_path(&bucket_rec.name, key);

        let staged = self.stage_payload(&file_path, body).await?;
        if let Some(declared) = length {
            let received = staged.size_bytes as u64;
            if declared != received {
                let _ = fs::remove_file(&staged.tmp_path).await;
                return Err(StoreError::LengthMismatch { declared, received });
            }
        }

        self.commit(&bucket_rec, key, &file_path, staged, content_type)
            .await
    }

    async fn get(&self, bucket: &str, key: &str) -> StoreResult<ObjectBody> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let info = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StoreError::Io(err)
            }
        })?;

        Ok(ObjectBody {
            info,
            reader: Box::new(file),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let result = sqlx::query("DELETE FROM objects WHERE key = ? AND bucket_id = ?")
            .bind(key)
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(())
    }

    async fn compose(
        &self,
        bucket: &str,
        target: &str,
        sources: &[String],
    ) -> StoreResult<ObjectInfo> {
        self.ensure_key_safe(target)?;
        if sources.is_empty() {
            return Err(StoreError::ComposeRejected("no source objects".into()));
        }
        if sources.len() > self.max_compose_sources {
            return Err(StoreError::ComposeRejected(format!(
                "{} sources exceed the limit of {}",
                sources.len(),
                self.max_compose_sources
            )));
        }

        let bucket_rec = self.fetch_bucket(bucket).await?;

        // Open every source up front so a missing one fails before anything
        // is written.
        let mut readers = Vec::with_capacity(sources.len());
        for source in sources {
            self.ensure_key_safe(source)?;
            self.fetch_object(&bucket_rec, source).await?;
            let path = self.object_path(&bucket_rec.name, source);
            let file = File::open(&path).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::NotFound {
                        key: source.clone(),
                    }
                } else {
                    StoreError::Io(err)
                }
            })?;
            readers.push(file);
        }

        let body: ByteStream = stream::iter(readers).flat_map(ReaderStream::new).boxed();
        let file_path = self.object_path(&bucket_rec.name, target);
        let staged = self.stage_payload(&file_path, body).await?;
        debug!(
            "composed {} sources into {} ({} bytes)",
            sources.len(),
            target,
            staged.size_bytes
        );

        self.commit(&bucket_rec, target, &file_path, staged, None)
            .await
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> StoreResult<Vec<StoreItem>> {
        let bucket_rec = self.fetch_bucket(bucket).await?;

        // A key range instead of LIKE so `%` and `_` in keys match literally.
        // Keyset pages: after a common prefix is emitted the next page starts
        // past every key below it, so rows read grow with entries returned.
        let upper = prefix_successor(prefix);
        let mut lower = prefix.to_string();
        let mut inclusive = true;
        let mut items = Vec::new();
        loop {
            let lower_op = if inclusive { ">=" } else { ">" };
            let page: Vec<ObjectInfo> = sqlx::query_as(&format!(
                "SELECT {OBJECT_COLUMNS} FROM objects
                 WHERE bucket_id = ? AND key {lower_op} ? AND (? IS NULL OR key < ?)
                 ORDER BY key ASC
                 LIMIT ?"
            ))
            .bind(bucket_rec.id)
            .bind(&lower)
            .bind(&upper)
            .bind(&upper)
            .bind(self.list_page_size)
            .fetch_all(&*self.db)
            .await?;

            let exhausted = (page.len() as i64) < self.list_page_size;
            for obj in &page {
                if obj.key < lower {
                    continue;
                }
                let common = if recursive {
                    None
                } else {
                    compute_common_prefix(&obj.key, prefix, "/")
                };
                match common {
                    Some(common) => {
                        let Some(next) = prefix_successor(&common) else {
                            items.push(StoreItem::prefix(common));
                            return Ok(items);
                        };
                        lower = next;
                        inclusive = true;
                        items.push(StoreItem::prefix(common));
                    }
                    None => {
                        lower = obj.key.clone();
                        inclusive = false;
                        items.push(StoreItem::object(obj));
                    }
                }
            }
            if exhausted {
                return Ok(items);
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one != 1 {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::Other,
                format!("unexpected SELECT 1 result: {}", one),
            )));
        }

        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"readyz" {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

/// Rename `from` over `to`, removing `to` first where the platform refuses
/// to replace an existing file.
async fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(to).await?;
            fs::rename(from, to).await
        }
        result => result,
    }
}

/// Put a previously linked payload back at `file_path`, or drop the new
/// payload when there was none.
async fn restore_previous(previous: Option<&Path>, file_path: &Path) {
    let result = match previous {
        Some(previous) => replace_file(previous, file_path).await,
        None => fs::remove_file(file_path).await,
    };
    if let Err(err) = result {
        warn!("failed to restore payload {}: {}", file_path.display(), err);
    }
}

/// Create `path` inside `dir`, creating `dir` when it is missing.
///
/// A concurrent delete may prune an empty shard directory right after it was
/// created, so a missing directory is recreated and the create retried.
async fn create_file_in(dir: &Path, path: &Path) -> io::Result<File> {
    const ATTEMPTS: usize = 3;
    let mut attempt = 1;
    loop {
        match File::create(path).await {
            Err(err) if err.kind() == ErrorKind::NotFound && attempt < ATTEMPTS => {
                debug!("shard directory {} missing, creating", dir.display());
                fs::create_dir_all(dir).await?;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Write a byte stream into `file`, returning its size and MD5 hex digest.
async fn write_stream(mut file: File, mut body: ByteStream) -> io::Result<(i64, String)> {
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

/// Compute the common prefix grouping `key` one level below `prefix`.
///
/// Returns `Some(prefix + segment + delimiter)` when `key` continues past the
/// delimiter, `None` for keys that are leaves at this level.
fn compute_common_prefix(key: &str, prefix: &str, delimiter: &str) -> Option<String> {
    let after_prefix = key.strip_prefix(prefix)?;
    let pos = after_prefix.find(delimiter)?;
    Some(format!(
        "{}{}",
        prefix,
        &after_prefix[..pos + delimiter.len()]
    ))
}

/// Smallest string sorting after every string that starts with `prefix`,
/// or `None` when no such bound exists (empty prefix).
///
/// UTF-8 byte order matches code point order, so bumping the last character
/// that can be bumped yields the bound.
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last as u32 + 1 {
            0xD800 => Some('\u{E000}'),
            code => char::from_u32(code),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalObjectStore {
        let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        LocalObjectStore::new(Arc::new(pool), "/tmp/unused")
    }

    #[tokio::test]
    async fn key_validation_rejects_traversal_segments_only() {
        let store = store();
        assert!(store.ensure_key_safe("a/b..c/d").is_ok());
        assert!(store.ensure_key_safe("a/../d").is_err());
        assert!(store.ensure_key_safe("..").is_err());
        assert!(store.ensure_key_safe("/abs").is_err());
        assert!(store.ensure_key_safe("").is_err());
        assert!(store.ensure_key_safe("a\\b").is_err());
    }

    #[tokio::test]
    async fn bucket_names_follow_s3_rules() {
        let store = store();
        assert!(store.ensure_bucket_name_safe("datasets").is_ok());
        assert!(store.ensure_bucket_name_safe("ab").is_err());
        assert!(store.ensure_bucket_name_safe("Datasets").is_err());
        assert!(store.ensure_bucket_name_safe("-data").is_err());
        assert!(store.ensure_bucket_name_safe("192.168.1.1").is_err());
    }

    #[tokio::test]
    async fn nested_keys_get_distinct_payload_paths() {
        let store = store();
        let file = store.object_path("datasets", "ds/video.mp4");
        let part = store.object_path("datasets", "ds/video.mp4/u1/1");
        assert_ne!(file, part);
        assert!(!part.starts_with(&file));
    }

    #[test]
    fn common_prefix_stops_at_first_delimiter() {
        assert_eq!(
            compute_common_prefix("ds/a/b/c", "ds/", "/"),
            Some("ds/a/".to_string())
        );
        assert_eq!(compute_common_prefix("ds/file", "ds/", "/"), None);
        assert_eq!(compute_common_prefix("other/x", "ds/", "/"), None);
    }

    #[test]
    fn prefix_successor_bounds_every_extension() {
        assert_eq!(prefix_successor("ds/a/"), Some("ds/a0".to_string()));
        assert_eq!(prefix_successor("z"), Some("{".to_string()));
        assert_eq!(prefix_successor("a\u{10FFFF}"), Some("b".to_string()));
        assert_eq!(prefix_successor("\u{D7FF}"), Some("\u{E000}".to_string()));
        assert_eq!(prefix_successor(""), None);
        assert_eq!(prefix_successor("\u{10FFFF}"), None);

        let bound = prefix_successor("ds/a/").unwrap();
        for key in ["ds/a/", "ds/a/x", "ds/a/\u{10FFFF}\u{10FFFF}"] {
            assert!(key < bound.as_str());
        }
        assert!("ds/a0" >= bound.as_str());
    }

    #[tokio::test]
    async fn staging_file_recreates_a_pruned_shard_directory() {
        let root = tempfile::tempdir().unwrap();
        let shard = root.path().join("datasets").join("ab").join("cd");
        fs::create_dir_all(&shard).await.unwrap();
        // A delete pruned the shard before the staging file was created.
        fs::remove_dir(&shard).await.unwrap();
        fs::remove_dir(shard.parent().unwrap()).await.unwrap();

        let path = shard.join(".tmp-staging");
        let mut file = create_file_in(&shard, &path).await.unwrap();
        file.write_all(b"payload").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"payload");
    }
}
