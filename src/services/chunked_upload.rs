//! Chunked upload coordinator.
//!
//! Parts are written as ordinary objects under
//! `{target_key}/{upload_id}/{part_number}` and assembled with a single store
//! compose. The coordinator keeps no state between calls: an upload session
//! is just a naming convention in the store's key space.

use crate::{
    models::{object::ObjectInfo, upload::UploadSession},
    services::{object_store::StoreError, store_client::StoreClient},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// How many transient parts are deleted concurrently after a compose.
const CLEANUP_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload id `{0}`")]
    InvalidUploadId(String),
    #[error("part {part_number} of upload `{upload_id}` has not been uploaded")]
    PartMissing { upload_id: String, part_number: u32 },
    #[error("compose rejected: {0}")]
    ComposeRejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Transient parts that survived a successful completion.
///
/// Never returned as an error: the composed object is already in place and
/// leftover parts are only clutter for an out-of-band sweep.
#[derive(Debug, Error)]
#[error("{} transient part(s) could not be removed", .failures.len())]
pub struct CleanupPartial {
    pub failures: Vec<PartCleanupFailure>,
}

#[derive(Debug)]
pub struct PartCleanupFailure {
    pub part_number: u32,
    pub key: String,
    pub error: StoreError,
}

#[derive(Debug)]
pub struct CompletedUpload {
    pub object: ObjectInfo,
    pub part_count: usize,
    pub cleanup: Option<CleanupPartial>,
}

#[derive(Clone)]
pub struct ChunkedUploadCoordinator {
    client: StoreClient,
}

impl ChunkedUploadCoordinator {
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }

    /// Store one chunk as a transient part. Re-sending a part overwrites it.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        part_number: u32,
        bytes: Bytes,
        target_key: &str,
    ) -> Result<ObjectInfo, UploadError> {
        let session = open_session(upload_id, target_key)?;
        let key = session.part_key(part_number);
        let info = self.client.put_bytes(&key, bytes, None).await?;
        debug!(part_key = %key, size = info.size_bytes, "stored transient part");
        Ok(info)
    }

    /// Compose the listed parts, in the given order, into `target_key` and
    /// remove them afterwards.
    ///
    /// The caller supplies the final byte order; the list is not re-sorted.
    /// Callers must not complete the same upload twice concurrently.
    #[instrument(skip(self, part_numbers), fields(parts = part_numbers.len()))]
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        target_key: &str,
        part_numbers: &[u32],
    ) -> Result<CompletedUpload, UploadError> {
        let session = open_session(upload_id, target_key)?;
        if part_numbers.is_empty() {
            return Err(UploadError::ComposeRejected("no parts listed".into()));
        }

        let sources: Vec<String> = part_numbers.iter().map(|n| session.part_key(*n)).collect();
        let object = match self.client.compose(&session.target_key, &sources).await {
            Ok(object) => object,
            Err(StoreError::NotFound { key }) => {
                return Err(match session.part_number_of(&key) {
                    Some(part_number) => UploadError::PartMissing {
                        upload_id: session.upload_id.clone(),
                        part_number,
                    },
                    None => StoreError::NotFound { key }.into(),
                });
            }
            Err(StoreError::ComposeRejected(reason)) => {
                return Err(UploadError::ComposeRejected(reason));
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            key = %object.key,
            size = object.size_bytes,
            "composed chunked upload"
        );

        let cleanup = self.remove_parts(&session, part_numbers).await;
        if let Some(partial) = &cleanup {
            for failure in &partial.failures {
                warn!(
                    part_key = %failure.key,
                    error = %failure.error,
                    "failed to remove transient part"
                );
            }
        }

        Ok(CompletedUpload {
            object,
            part_count: part_numbers.len(),
            cleanup,
        })
    }

    async fn remove_parts(
        &self,
        session: &UploadSession,
        part_numbers: &[u32],
    ) -> Option<CleanupPartial> {
        let mut seen = HashSet::new();
        let unique: Vec<u32> = part_numbers
            .iter()
            .copied()
            .filter(|n| seen.insert(*n))
            .collect();

        let failures: Vec<PartCleanupFailure> = stream::iter(unique)
            .map(|part_number| {
                let key = session.part_key(part_number);
                async move {
                    match self.client.delete(&key).await {
                        Ok(()) => None,
                        Err(error) => Some(PartCleanupFailure {
                            part_number,
                            key,
                            error,
                        }),
                    }
                }
            })
            .buffer_unordered(CLEANUP_CONCURRENCY)
            .filter_map(|failure| async move { failure })
            .collect()
            .await;

        (!failures.is_empty()).then_some(CleanupPartial { failures })
    }
}

/// Build a session, rejecting upload ids that would break part key
/// derivation.
fn open_session(upload_id: &str, target_key: &str) -> Result<UploadSession, UploadError> {
    if upload_id.is_empty()
        || upload_id.contains('/')
        || upload_id == "."
        || upload_id == ".."
    {
        return Err(UploadError::InvalidUploadId(upload_id.to_string()));
    }
    Ok(UploadSession::new(upload_id, target_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_ids_with_separators_are_rejected() {
        assert!(matches!(
            open_session("a/b", "x"),
            Err(UploadError::InvalidUploadId(_))
        ));
        assert!(matches!(
            open_session("", "x"),
            Err(UploadError::InvalidUploadId(_))
        ));
        assert!(open_session("u1", "ds/video.mp4").is_ok());
    }

    #[test]
    fn cleanup_partial_reports_failure_count() {
        let partial = CleanupPartial {
            failures: vec![PartCleanupFailure {
                part_number: 2,
                key: "t/u/2".into(),
                error: StoreError::NotFound { key: "t/u/2".into() },
            }],
        };
        assert_eq!(partial.to_string(), "1 transient part(s) could not be removed");
    }
}
