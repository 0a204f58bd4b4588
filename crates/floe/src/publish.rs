//! Temp-then-move publishing of data files.
//!
//! A data file is uploaded as `_{name}.temp`, which the consumer's
//! `^\d+\.parquet$` pattern never matches, then moved to `{name}` with a
//! no-clobber operation. The final name only ever appears with complete
//! content.

use bytes::Bytes;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use floe_core::{MB, NamespaceKind, StorageError};

use crate::emit;
use crate::error::{FormatError, PublishError, SweepSnafu, UploadSnafu, WriteSnafu};
use crate::landing::{LandingZone, MirroredTable, is_temp_name, temp_name};
use crate::metrics::events::StaleTempFilesRemoved;

const MULTIPART_PART_SIZE: usize = 10 * MB;
const MIN_MULTIPART_SIZE: usize = 100 * MB;
const MAX_CONCURRENT_PARTS: usize = 8;

/// A data file visible under its final name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    pub path: Path,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AtomicPublisher {
    landing: LandingZone,
}

impl AtomicPublisher {
    pub fn new(landing: LandingZone) -> Self {
        Self { landing }
    }

    pub fn namespace(&self) -> NamespaceKind {
        self.landing.namespace()
    }

    /// Publish `file_name` into the table folder with content produced by `write`.
    ///
    /// If `write` fails nothing is uploaded. If the final name is already
    /// taken by a non-empty object the temp object is removed and
    /// [`PublishError::SequenceConflict`] is returned; an empty one is
    /// replaced.
    pub async fn publish<F>(
        &self,
        table: &MirroredTable,
        file_name: &str,
        write: F,
    ) -> Result<PublishedFile, PublishError>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), FormatError>,
    {
        let temp = table.file_path(&temp_name(file_name));
        let target = table.file_path(file_name);

        let mut buffer = Vec::new();
        write(&mut buffer).context(WriteSnafu { file: file_name })?;
        let bytes = buffer.len();

        if let Err(e) = self.upload(&temp, Bytes::from(buffer)).await {
            self.discard_temp(table, &temp).await;
            return Err(e).context(UploadSnafu {
                path: temp.to_string(),
            });
        }

        if let Err(e) = self.finalize(table, &temp, &target, bytes).await {
            self.discard_temp(table, &temp).await;
            return Err(e);
        }

        info!(target = %table, file = file_name, bytes, namespace = %self.namespace(), "Published data file");
        Ok(PublishedFile {
            path: target,
            bytes,
        })
    }

    async fn upload(&self, temp: &Path, data: Bytes) -> Result<(), StorageError> {
        let storage = self.landing.storage();
        if data.len() >= MIN_MULTIPART_SIZE {
            storage
                .put_multipart_bytes(
                    temp,
                    data,
                    MULTIPART_PART_SIZE,
                    MIN_MULTIPART_SIZE,
                    MAX_CONCURRENT_PARTS,
                )
                .await
        } else {
            storage.put_parquet(temp, PutPayload::from(data)).await
        }
    }

    /// Move the temp object to `target` without overwriting.
    ///
    /// object_store implements `rename_if_not_exists` natively only on some
    /// backends; elsewhere (Azure, local) it is a no-clobber copy followed by
    /// a delete of the source, which can fail after the copy landed.
    async fn move_temp(&self, temp: &Path, target: &Path) -> Result<(), StorageError> {
        let storage = self.landing.storage();
        match self.namespace() {
            NamespaceKind::Hierarchical => storage.rename_if_not_exists(temp, target).await,
            NamespaceKind::Flat => storage.copy_if_not_exists(temp, target).await,
        }
    }

    async fn finalize(
        &self,
        table: &MirroredTable,
        temp: &Path,
        target: &Path,
        bytes: usize,
    ) -> Result<(), PublishError> {
        let mut result = self.move_temp(temp, target).await;
        if matches!(&result, Err(e) if e.is_already_exists())
            && self.reclaim_empty(table, target).await
        {
            result = self.move_temp(temp, target).await;
        }

        let mut temp_left = self.namespace() == NamespaceKind::Flat;
        match result {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                return Err(PublishError::SequenceConflict {
                    path: target.to_string(),
                });
            }
            Err(source) => {
                if !self.holds(target, bytes).await {
                    return Err(PublishError::Finalize {
                        from: temp.to_string(),
                        to: target.to_string(),
                        source,
                    });
                }
                warn!(target = %table, path = %target, error = %source, "Move failed after the data file landed");
                temp_left = true;
            }
        }

        // The final object is already visible; a leftover temp is swept on the next cold start.
        if temp_left
            && let Err(e) = self.landing.storage().delete_if_exists(temp).await
        {
            warn!(target = %table, path = %temp, error = %e, "Failed to delete temp object after copy");
        }
        Ok(())
    }

    /// Whether `target` exists with exactly `bytes` bytes.
    async fn holds(&self, target: &Path, bytes: usize) -> bool {
        matches!(
            self.landing.storage().head(target).await,
            Ok(meta) if meta.size == bytes as u64
        )
    }

    /// Remove a zero-length object occupying `target`.
    ///
    /// Zero-length data files are never produced by a complete publish; the
    /// allocator skips them, so their sequence number gets handed out again.
    async fn reclaim_empty(&self, table: &MirroredTable, target: &Path) -> bool {
        let storage = self.landing.storage();
        if !matches!(storage.head(target).await, Ok(meta) if meta.size == 0) {
            return false;
        }
        match storage.delete_if_exists(target).await {
            Ok(_) => {
                warn!(target = %table, path = %target, "Removed empty data file left by an interrupted publish");
                true
            }
            Err(e) => {
                warn!(target = %table, path = %target, error = %e, "Failed to remove empty data file");
                false
            }
        }
    }

    async fn discard_temp(&self, table: &MirroredTable, temp: &Path) {
        if let Err(e) = self.landing.storage().delete_if_exists(temp).await {
            warn!(target = %table, path = %temp, error = %e, "Failed to remove temp object");
        }
    }

    /// Delete `_*.temp` objects left in the table folder by an interrupted
    /// publish. Returns how many were removed.
    pub async fn sweep_stale_temps(&self, table: &MirroredTable) -> Result<usize, PublishError> {
        let folder = table.landing_path();
        let storage = self.landing.storage();
        let listing = storage.list_directory(&folder).await.context(SweepSnafu {
            path: folder.to_string(),
        })?;

        let mut removed = 0;
        for meta in &listing.objects {
            if !meta.location.filename().is_some_and(is_temp_name) {
                continue;
            }
            debug!(target = %table, path = %meta.location, "Removing stale temp object");
            if storage
                .delete_if_exists(&meta.location)
                .await
                .context(SweepSnafu {
                    path: meta.location.to_string(),
                })?
            {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(target = %table, removed, "Removed stale temp objects");
            emit!(StaleTempFilesRemoved {
                table: table.to_string(),
                count: removed,
            });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landing::data_file_name;
    use crate::testing::counting_storage;
    use floe_core::StorageProvider;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn publisher(dir: &TempDir, namespace: NamespaceKind) -> AtomicPublisher {
        let storage = StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        AtomicPublisher::new(LandingZone::new(Arc::new(storage), Some(namespace)))
    }

    fn orders() -> MirroredTable {
        MirroredTable::new("ws", "Sales", None, "Orders")
    }

    fn folder_names(dir: &TempDir) -> Vec<String> {
        let folder = dir.path().join("Files/LandingZone/Orders");
        let mut names: Vec<String> = match std::fs::read_dir(folder) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn write_bytes(content: &'static [u8]) -> impl FnOnce(&mut Vec<u8>) -> Result<(), FormatError> {
        move |buf| {
            buf.extend_from_slice(content);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_hierarchical() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, NamespaceKind::Hierarchical).await;
        let name = data_file_name(1);

        let published = publisher
            .publish(&orders(), &name, write_bytes(b"PAR1data"))
            .await
            .unwrap();

        assert_eq!(published.bytes, 8);
        assert_eq!(published.path, orders().file_path(&name));
        assert_eq!(folder_names(&dir), vec![name]);
    }

    #[tokio::test]
    async fn test_publish_flat_removes_temp() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, NamespaceKind::Flat).await;
        let name = data_file_name(1);

        publisher
            .publish(&orders(), &name, write_bytes(b"PAR1data"))
            .await
            .unwrap();
        assert_eq!(folder_names(&dir), vec![name]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_final_file() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, NamespaceKind::Hierarchical).await;

        let err = publisher
            .publish(&orders(), &data_file_name(1), |buf| {
                buf.extend_from_slice(b"partial");
                Err(FormatError::RowWidth {
                    row: 0,
                    expected: 2,
                    found: 1,
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Write { .. }));
        assert!(folder_names(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_taken_sequence_is_a_conflict() {
        for namespace in [NamespaceKind::Hierarchical, NamespaceKind::Flat] {
            let dir = TempDir::new().unwrap();
            let publisher = publisher(&dir, namespace).await;
            let name = data_file_name(2);

            publisher
                .publish(&orders(), &name, write_bytes(b"first"))
                .await
                .unwrap();
            let err = publisher
                .publish(&orders(), &name, write_bytes(b"second"))
                .await
                .unwrap_err();

            assert!(matches!(err, PublishError::SequenceConflict { .. }));
            assert_eq!(folder_names(&dir), vec![name.clone()]);
            let kept = std::fs::read(dir.path().join("Files/LandingZone/Orders").join(&name)).unwrap();
            assert_eq!(kept, b"first");
        }
    }

    #[tokio::test]
    async fn test_sweep_stale_temps() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("Files/LandingZone/Orders");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(data_file_name(1)), b"PAR1").unwrap();
        std::fs::write(folder.join(temp_name(&data_file_name(2))), b"half").unwrap();
        std::fs::write(folder.join("_metadata.json"), b"{}").unwrap();

        let publisher = publisher(&dir, NamespaceKind::Hierarchical).await;
        assert_eq!(publisher.sweep_stale_temps(&orders()).await.unwrap(), 1);
        assert_eq!(
            folder_names(&dir),
            vec![data_file_name(1), "_metadata.json".to_string()]
        );
        assert_eq!(publisher.sweep_stale_temps(&orders()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_final_file_is_replaced() {
        for namespace in [NamespaceKind::Hierarchical, NamespaceKind::Flat] {
            let dir = TempDir::new().unwrap();
            let folder = dir.path().join("Files/LandingZone/Orders");
            std::fs::create_dir_all(&folder).unwrap();
            std::fs::write(folder.join(data_file_name(3)), b"").unwrap();

            let publisher = publisher(&dir, namespace).await;
            publisher
                .publish(&orders(), &data_file_name(3), write_bytes(b"PAR1data"))
                .await
                .unwrap();

            assert_eq!(folder_names(&dir), vec![data_file_name(3)]);
            assert_eq!(std::fs::read(folder.join(data_file_name(3))).unwrap(), b"PAR1data");
        }
    }

    #[tokio::test]
    async fn test_failed_temp_delete_after_move_still_publishes() {
        for namespace in [NamespaceKind::Hierarchical, NamespaceKind::Flat] {
            let dir = TempDir::new().unwrap();
            let (storage, store) = counting_storage(&dir).await;
            let publisher = AtomicPublisher::new(LandingZone::new(storage, Some(namespace)));
            let name = data_file_name(1);

            store.refuse_deletes(true);
            let published = publisher
                .publish(&orders(), &name, write_bytes(b"PAR1data"))
                .await
                .unwrap();
            assert_eq!(published.bytes, 8);

            // The temp is left behind for the cold-start sweep.
            assert_eq!(folder_names(&dir), vec![name.clone(), temp_name(&name)]);
            store.refuse_deletes(false);
            assert_eq!(publisher.sweep_stale_temps(&orders()).await.unwrap(), 1);
            assert_eq!(folder_names(&dir), vec![name]);
        }
    }

    #[tokio::test]
    async fn test_failed_move_without_final_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, NamespaceKind::Flat).await;
        let table = orders();
        let temp = table.file_path("_missing.temp");
        let target = table.file_path(&data_file_name(1));

        let err = publisher.finalize(&table, &temp, &target, 8).await.unwrap_err();
        assert!(matches!(err, PublishError::Finalize { .. }));
        assert!(folder_names(&dir).is_empty());
    }
}
