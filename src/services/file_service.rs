//! FileService: the state shared by every HTTP handler.
//!
//! Bundles the store client with the three core components and carries the
//! plain pass-through operations (whole-object upload, download, delete).

use crate::{
    models::object::ObjectInfo,
    services::{
        archive_extractor::{ArchiveExtractor, ExtractionError, ExtractionReport},
        chunked_upload::ChunkedUploadCoordinator,
        listing::ListingProjector,
        object_store::{ByteStream, ObjectBody, StoreError, StoreResult},
        store_client::StoreClient,
    },
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

/// What a single-shot upload turned into.
#[derive(Debug)]
pub enum UploadOutcome {
    Stored(ObjectInfo),
    Extracted {
        prefix: String,
        report: ExtractionReport,
    },
}

#[derive(Clone)]
pub struct FileService {
    pub client: StoreClient,
    pub uploads: ChunkedUploadCoordinator,
    pub archives: ArchiveExtractor,
    pub listing: ListingProjector,
}

impl FileService {
    pub fn new(client: StoreClient, max_entry_bytes: u64) -> Self {
        Self {
            uploads: ChunkedUploadCoordinator::new(client.clone()),
            archives: ArchiveExtractor::new(client.clone(), max_entry_bytes),
            listing: ListingProjector::new(client.clone()),
            client,
        }
    }

    pub async fn upload_object(
        &self,
        key: &str,
        body: ByteStream,
        length: Option<u64>,
        content_type: Option<String>,
    ) -> StoreResult<ObjectInfo> {
        let info = self.client.put(key, body, length, content_type).await?;
        info!(key = %info.key, size = info.size_bytes, "stored object");
        Ok(info)
    }

    /// Store an uploaded file under directory `dir`.
    ///
    /// `.zip` files are unpacked under `dir` + the file name without its
    /// extension instead of being stored as a single object.
    pub async fn upload_file(
        &self,
        dir: &str,
        file_name: &str,
        body: ByteStream,
        content_type: Option<String>,
    ) -> Result<UploadOutcome, FileError> {
        let base_name = file_name
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .ok_or_else(|| FileError::InvalidFileName(file_name.to_string()))?;

        match archive_stem(base_name) {
            Some(stem) => {
                let prefix = format!("{}{}", dir, stem);
                let report = self.archives.extract(body, &prefix).await?;
                Ok(UploadOutcome::Extracted { prefix, report })
            }
            None => {
                let key = format!("{}{}", dir, base_name);
                let info = self.upload_object(&key, body, None, content_type).await?;
                Ok(UploadOutcome::Stored(info))
            }
        }
    }

    pub async fn download(&self, key: &str) -> StoreResult<ObjectBody> {
        self.client.get(key).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.client.delete(key).await?;
        info!(%key, "deleted object");
        Ok(())
    }
}

/// File name without a case-insensitive `.zip` extension, if it has one.
fn archive_stem(file_name: &str) -> Option<&str> {
    let split = file_name.len().checked_sub(4)?;
    let (stem, ext) = (file_name.get(..split)?, file_name.get(split..)?);
    (ext.eq_ignore_ascii_case(".zip") && !stem.is_empty()).then_some(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_extension_is_case_insensitive() {
        assert_eq!(archive_stem("photos.ZIP"), Some("photos"));
        assert_eq!(archive_stem("photos.zip"), Some("photos"));
        assert_eq!(archive_stem("photos.tar"), None);
        assert_eq!(archive_stem(".zip"), None);
        assert_eq!(archive_stem("zip"), None);
    }
}
