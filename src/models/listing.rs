//! Entries returned by a directory-style listing.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer, ser::SerializeStruct};

/// One element of a hierarchical listing.
///
/// Directories are synthesized from keys sharing a first-level prefix; their
/// name always ends with `/`. Files are leaf keys directly under the queried
/// prefix.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ListingEntry {
    Directory {
        name: String,
    },
    File {
        name: String,
        size: u64,
        last_modified: Option<DateTime<Utc>>,
    },
}

impl ListingEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Directory { name } | Self::File { name, .. } => name,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }
}

/// Flat wire shape: `{ name, isDir, size, lastModified }`.
impl Serialize for ListingEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ListingEntry", 4)?;
        match self {
            Self::Directory { name } => {
                state.serialize_field("name", name)?;
                state.serialize_field("isDir", &true)?;
                state.serialize_field("size", &0u64)?;
                state.serialize_field("lastModified", &None::<DateTime<Utc>>)?;
            }
            Self::File {
                name,
                size,
                last_modified,
            } => {
                state.serialize_field("name", name)?;
                state.serialize_field("isDir", &false)?;
                state.serialize_field("size", size)?;
                state.serialize_field("lastModified", last_modified)?;
            }
        }
        state.end()
    }
}
