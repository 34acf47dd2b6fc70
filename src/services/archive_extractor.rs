//! Archive extraction pipeline.
//!
//! The upload is spooled to an anonymous temporary file, then walked on the
//! blocking thread pool, which hands entries one at a time over a channel of
//! capacity one. At most one entry payload is held in memory at any point,
//! independent of archive size.
//!
//! Complete archives are read through their central directory, so entries
//! whose sizes only follow the data (general purpose flag bit 3) are handled.
//! When the central directory is missing the local headers are walked in
//! order instead, which keeps every entry preceding a truncation point.
//!
//! Entries are written as individual objects under the destination prefix.
//! Extraction is not transactional: objects written before a failure stay.

use crate::services::{object_store::StoreError, store_client::StoreClient};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tracing::{debug, info, warn};
use zip::{ZipArchive, read::read_zipfile_from_stream};

/// Archive members carry no reliable type information.
const ENTRY_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("archive is corrupt or truncated: {reason}")]
    Corrupt { reason: String, written: usize },
    #[error("storing archive entry failed after {written} object(s): {source}")]
    Store {
        written: usize,
        #[source]
        source: StoreError,
    },
    #[error("spooling archive to disk failed: {0}")]
    Spool(#[source] io::Error),
    #[error("archive reader aborted: {0}")]
    Aborted(String),
}

/// Why an entry was left out of the extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The path climbs above its own root with a `..` segment.
    ParentTraversal,
    /// Nothing but separators and `.` segments.
    EmptyPath,
    InvalidCharacter,
    TooLarge,
    /// The store refused the resulting key.
    InvalidKey,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ParentTraversal => "path escapes destination",
            Self::EmptyPath => "empty path",
            Self::InvalidCharacter => "control character in path",
            Self::TooLarge => "entry exceeds size limit",
            Self::InvalidKey => "key rejected by store",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: SkipReason,
}

#[derive(Debug, Default, Serialize)]
pub struct ExtractionReport {
    /// Number of objects stored.
    pub written: usize,
    /// Entries left out; directory entries are never listed here.
    pub skipped: Vec<SkippedEntry>,
}

/// A file inside the archive with a sanitized relative path.
#[derive(Debug)]
struct ArchiveEntry {
    path: String,
    bytes: Bytes,
}

#[derive(Debug)]
enum EntryEvent {
    Entry(ArchiveEntry),
    Skipped(SkippedEntry),
}

#[derive(Clone)]
pub struct ArchiveExtractor {
    client: StoreClient,
    max_entry_bytes: u64,
}

impl ArchiveExtractor {
    pub fn new(client: StoreClient, max_entry_bytes: u64) -> Self {
        Self {
            client,
            max_entry_bytes,
        }
    }

    /// Extract every file entry of `archive` under `destination_prefix`.
    pub async fn extract<S>(
        &self,
        archive: S,
        destination_prefix: &str,
    ) -> Result<ExtractionReport, ExtractionError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let prefix = destination_prefix.trim_end_matches('/');
        let spooled = spool(archive).await?;
        let (tx, mut rx) = mpsc::channel(1);
        let max_entry_bytes = self.max_entry_bytes;
        let worker =
            tokio::task::spawn_blocking(move || read_entries(spooled, max_entry_bytes, tx));

        let mut report = ExtractionReport::default();
        let mut store_failure = None;
        while let Some(event) = rx.recv().await {
            match event {
                EntryEvent::Skipped(skipped) => {
                    warn!(path = %skipped.path, reason = %skipped.reason, "skipping archive entry");
                    report.skipped.push(skipped);
                }
                EntryEvent::Entry(entry) => {
                    let key = destination_key(prefix, &entry.path);
                    let size = entry.bytes.len();
                    match self
                        .client
                        .put_bytes(&key, entry.bytes, Some(ENTRY_CONTENT_TYPE.to_string()))
                        .await
                    {
                        Ok(_) => {
                            debug!(%key, size, "stored archive entry");
                            report.written += 1;
                        }
                        Err(StoreError::InvalidKey(_)) => {
                            warn!(path = %entry.path, "store rejected archive entry key");
                            report.skipped.push(SkippedEntry {
                                path: entry.path,
                                reason: SkipReason::InvalidKey,
                            });
                        }
                        Err(err) => {
                            store_failure = Some(err);
                            break;
                        }
                    }
                }
            }
        }
        // Dropping the receiver unblocks the reader if we stopped early.
        drop(rx);

        let read_result = worker
            .await
            .map_err(|err| ExtractionError::Aborted(err.to_string()))?;

        if let Some(source) = store_failure {
            return Err(ExtractionError::Store {
                written: report.written,
                source,
            });
        }
        if let Err(reason) = read_result {
            return Err(ExtractionError::Corrupt {
                reason,
                written: report.written,
            });
        }

        info!(
            prefix,
            written = report.written,
            skipped = report.skipped.len(),
            "archive extracted"
        );
        Ok(report)
    }
}

/// Copy the request body into an unnamed temporary file and rewind it.
///
/// A failing body stream means the upload was cut short and is reported as
/// [`ExtractionError::Corrupt`]; local disk failures are [`ExtractionError::Spool`].
async fn spool<S>(archive: S) -> Result<File, ExtractionError>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let file = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(|err| ExtractionError::Aborted(err.to_string()))?
        .map_err(ExtractionError::Spool)?;
    let mut file = tokio::fs::File::from_std(file);

    let mut archive = archive.boxed();
    let mut total: u64 = 0;
    while let Some(chunk) = archive.next().await {
        let chunk = chunk.map_err(|err| ExtractionError::Corrupt {
            reason: format!("archive body ended early: {}", err),
            written: 0,
        })?;
        total += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(ExtractionError::Spool)?;
    }
    file.flush().await.map_err(ExtractionError::Spool)?;
    debug!(bytes = total, "archive spooled");

    let mut file = file.into_std().await;
    file.seek(SeekFrom::Start(0)).map_err(ExtractionError::Spool)?;
    Ok(file)
}

/// Blocking side: send every entry of the spooled archive in archive order.
///
/// Stops quietly when the receiver goes away.
fn read_entries(
    file: File,
    max_entry_bytes: u64,
    tx: mpsc::Sender<EntryEvent>,
) -> Result<(), String> {
    let mut archive = match ZipArchive::new(&file) {
        Ok(archive) => archive,
        Err(err) => {
            debug!(error = %err, "no usable central directory, walking local headers");
            (&file)
                .seek(SeekFrom::Start(0))
                .map_err(|err| err.to_string())?;
            return read_local_headers(&file, max_entry_bytes, tx);
        }
    };

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|err| err.to_string())?;
        if entry.is_dir() {
            continue;
        }
        let raw_name = entry.name().to_string();
        let declared_size = entry.size();
        let event = entry_event(raw_name, declared_size, &mut entry, max_entry_bytes)?;
        drop(entry);

        if tx.blocking_send(event).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Forward-only walk over local file headers, used when the archive has no
/// central directory. Entries that defer their sizes to a trailing data
/// descriptor cannot be read this way and end the walk with an error.
fn read_local_headers<R: Read>(
    mut reader: R,
    max_entry_bytes: u64,
    tx: mpsc::Sender<EntryEvent>,
) -> Result<(), String> {
    loop {
        let mut file = match read_zipfile_from_stream(&mut reader) {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err.to_string()),
        };
        if file.is_dir() {
            continue;
        }
        let raw_name = file.name().to_string();
        let declared_size = file.size();
        let event = entry_event(raw_name, declared_size, &mut file, max_entry_bytes)?;
        drop(file);

        if tx.blocking_send(event).is_err() {
            return Ok(());
        }
    }
}

/// Sanitize the entry name and read its payload, bounded by `max_entry_bytes`.
fn entry_event<R: Read>(
    raw_name: String,
    declared_size: u64,
    payload: &mut R,
    max_entry_bytes: u64,
) -> Result<EntryEvent, String> {
    let path = match sanitize_entry_path(&raw_name) {
        Ok(path) if declared_size <= max_entry_bytes => path,
        Ok(_) => return Ok(skipped(raw_name, SkipReason::TooLarge)),
        Err(reason) => return Ok(skipped(raw_name, reason)),
    };

    let mut buf = Vec::with_capacity(declared_size as usize);
    payload
        .take(max_entry_bytes + 1)
        .read_to_end(&mut buf)
        .map_err(|err| format!("reading `{}`: {}", raw_name, err))?;
    if buf.len() as u64 > max_entry_bytes {
        return Ok(skipped(raw_name, SkipReason::TooLarge));
    }
    Ok(EntryEvent::Entry(ArchiveEntry {
        path,
        bytes: Bytes::from(buf),
    }))
}

fn skipped(path: String, reason: SkipReason) -> EntryEvent {
    EntryEvent::Skipped(SkippedEntry { path, reason })
}

/// Normalize an entry name into a relative path that cannot leave its root.
///
/// Backslashes become `/`, empty and `.` segments are dropped, and any `..`
/// segment rejects the whole entry.
pub fn sanitize_entry_path(name: &str) -> Result<String, SkipReason> {
    let normalized = name.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(SkipReason::ParentTraversal),
            s if s.chars().any(char::is_control) => return Err(SkipReason::InvalidCharacter),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(SkipReason::EmptyPath);
    }
    Ok(segments.join("/"))
}

/// `prefix/path`, or just `path` at the root.
fn destination_key(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}
