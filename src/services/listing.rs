//! Hierarchical listing projector.
//!
//! Presents one level of the flat key space as a directory: keys continuing
//! past the next `/` collapse into a single directory entry, the rest are
//! files.

use crate::{
    models::listing::ListingEntry,
    services::{object_store::StoreResult, store_client::StoreClient},
};
use std::collections::HashSet;

const SEPARATOR: char = '/';

#[derive(Clone)]
pub struct ListingProjector {
    client: StoreClient,
}

impl ListingProjector {
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }

    /// List the entries directly under `prefix`. `"/"` means the root.
    ///
    /// Order follows the store's listing; directories and files may
    /// interleave. Never mutates the store.
    pub async fn list(&self, prefix: &str) -> StoreResult<Vec<ListingEntry>> {
        let prefix = if prefix == "/" { "" } else { prefix };
        let items = self.client.list_prefix(prefix, false).await?;

        let mut entries = Vec::with_capacity(items.len());
        let mut seen_dirs = HashSet::new();
        for item in items {
            let Some(remaining) = item.key.strip_prefix(prefix) else {
                continue;
            };
            match remaining.find(SEPARATOR) {
                Some(pos) => {
                    let name = &remaining[..=pos];
                    if seen_dirs.insert(name.to_string()) {
                        entries.push(ListingEntry::Directory {
                            name: name.to_string(),
                        });
                    }
                }
                None if remaining.is_empty() => {}
                None => entries.push(ListingEntry::File {
                    name: remaining.to_string(),
                    size: item.size,
                    last_modified: item.last_modified,
                }),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::ObjectInfo,
        services::object_store::{ByteStream, ObjectBody, ObjectStore, StoreError, StoreItem},
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Returns a fixed listing, ignoring the prefix, so projection can be
    /// checked against inputs a real store would never produce.
    struct ScriptedStore(Vec<StoreItem>);

    #[async_trait]
    impl ObjectStore for ScriptedStore {
        async fn ensure_bucket(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn put(
            &self,
            _: &str,
            key: &str,
            _: ByteStream,
            _: Option<u64>,
            _: Option<String>,
        ) -> StoreResult<ObjectInfo> {
            Err(StoreError::InvalidKey(key.into()))
        }
        async fn get(&self, _: &str, key: &str) -> StoreResult<ObjectBody> {
            Err(StoreError::NotFound { key: key.into() })
        }
        async fn delete(&self, _: &str, key: &str) -> StoreResult<()> {
            Err(StoreError::NotFound { key: key.into() })
        }
        async fn compose(&self, _: &str, target: &str, _: &[String]) -> StoreResult<ObjectInfo> {
            Err(StoreError::InvalidKey(target.into()))
        }
        async fn list_prefix(&self, _: &str, _: &str, _: bool) -> StoreResult<Vec<StoreItem>> {
            Ok(self.0.clone())
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    fn file(key: &str, size: u64) -> StoreItem {
        StoreItem {
            key: key.into(),
            size,
            last_modified: None,
            is_prefix: false,
        }
    }

    fn projector(items: Vec<StoreItem>) -> ListingProjector {
        ListingProjector::new(StoreClient::new(Arc::new(ScriptedStore(items)), "datasets"))
    }

    #[tokio::test]
    async fn deeper_keys_collapse_into_one_directory() {
        let entries = projector(vec![file("a/x", 1), file("a/y", 1), file("b", 3)])
            .list("")
            .await
            .unwrap();
        assert_eq!(
            entries,
            vec![
                ListingEntry::Directory { name: "a/".into() },
                ListingEntry::File {
                    name: "b".into(),
                    size: 3,
                    last_modified: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn slash_prefix_means_root() {
        let entries = projector(vec![file("b", 3)]).list("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), "b");
    }

    #[tokio::test]
    async fn common_prefixes_and_deep_keys_dedupe_together() {
        let entries = projector(vec![
            StoreItem::prefix("ds/a/"),
            file("ds/a/deep/x", 1),
            file("ds/f.txt", 2),
        ])
        .list("ds/")
        .await
        .unwrap();
        let dirs: Vec<_> = entries.iter().filter(|e| e.is_directory()).collect();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].name(), "a/");
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn prefix_marker_itself_is_not_listed() {
        let entries = projector(vec![file("ds/", 0), file("ds/f", 1)])
            .list("ds/")
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), "f");
    }
}
