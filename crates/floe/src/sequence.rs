//! Next-sequence computation from a table folder listing.

use object_store::ObjectMeta;
use object_store::path::Path;
use snafu::ResultExt;
use tracing::debug;

use crate::error::{ListSnafu, SequenceError};
use crate::landing::{LandingZone, MirroredTable, parse_data_file_name};

/// Result of scanning a table folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceScan {
    /// Sequence number the next data file must use.
    pub next: u64,
    /// Most recent non-empty data file, if any.
    pub latest: Option<Path>,
}

/// Scan a name-sorted listing.
///
/// Data file names are purely numeric, so they sort before `_metadata.json`
/// and every underscore-prefixed control entry; the scan stops at the first
/// entry that is not a data file. Zero-length files are interrupted publishes
/// and are skipped.
pub fn scan_listing(objects: &[ObjectMeta]) -> SequenceScan {
    let mut max = 0u64;
    let mut latest = None;

    for meta in objects {
        let Some(sequence) = meta.location.filename().and_then(parse_data_file_name) else {
            break;
        };
        if meta.size == 0 {
            continue;
        }
        if sequence >= max {
            max = sequence;
            latest = Some(meta.location.clone());
        }
    }

    SequenceScan {
        next: max + 1,
        latest,
    }
}

/// Computes the next sequence number for a table.
#[derive(Debug, Clone)]
pub struct SequenceAllocator {
    landing: LandingZone,
}

impl SequenceAllocator {
    pub fn new(landing: LandingZone) -> Self {
        Self { landing }
    }

    pub async fn next_sequence(&self, table: &MirroredTable) -> Result<u64, SequenceError> {
        Ok(self.scan(table).await?.next)
    }

    /// List the table folder and scan it.
    ///
    /// A folder with nothing in it does not exist as far as an object store
    /// is concerned; the table must have its metadata written first.
    pub async fn scan(&self, table: &MirroredTable) -> Result<SequenceScan, SequenceError> {
        let path = table.landing_path();
        let listing = self
            .landing
            .storage()
            .list_directory(&path)
            .await
            .context(ListSnafu {
                path: path.to_string(),
            })?;

        if listing.is_empty() {
            return Err(SequenceError::TableNotFound {
                path: path.to_string(),
            });
        }

        let scan = scan_listing(&listing.objects);
        debug!(target = %table, next = scan.next, "Scanned table folder");
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landing::data_file_name;
    use floe_core::StorageProvider;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn meta(name: &str, size: u64) -> ObjectMeta {
        ObjectMeta {
            location: Path::from(format!("Files/LandingZone/Customers/{name}")),
            last_modified: chrono::Utc::now(),
            size,
            e_tag: None,
            version: None,
        }
    }

    async fn landing(dir: &TempDir) -> LandingZone {
        let storage = StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        LandingZone::new(Arc::new(storage), None)
    }

    fn customers() -> MirroredTable {
        MirroredTable::new("ws", "Sales", None, "Customers")
    }

    #[test]
    fn test_no_data_files_starts_at_one() {
        let scan = scan_listing(&[meta("_metadata.json", 30)]);
        assert_eq!(scan.next, 1);
        assert_eq!(scan.latest, None);
    }

    #[test]
    fn test_next_after_existing_files() {
        let objects = [
            meta(&data_file_name(1), 100),
            meta(&data_file_name(2), 100),
            meta("_metadata.json", 30),
        ];
        assert_eq!(scan_listing(&objects).next, 3);
    }

    #[test]
    fn test_zero_length_file_ignored() {
        let objects = [
            meta(&data_file_name(1), 100),
            meta(&data_file_name(2), 100),
            meta(&data_file_name(3), 0),
            meta("_metadata.json", 30),
        ];
        let scan = scan_listing(&objects);
        assert_eq!(scan.next, 3);
        assert_eq!(
            scan.latest.unwrap().filename(),
            Some(data_file_name(2).as_str())
        );
    }

    #[test]
    fn test_scan_stops_at_first_control_entry() {
        let objects = [
            meta(&data_file_name(4), 100),
            meta("_00000000000000000009.parquet.temp", 100),
            meta("_metadata.json", 30),
        ];
        assert_eq!(scan_listing(&objects).next, 5);
    }

    #[tokio::test]
    async fn test_missing_table_folder() {
        let dir = TempDir::new().unwrap();
        let allocator = SequenceAllocator::new(landing(&dir).await);

        let err = allocator.next_sequence(&customers()).await.unwrap_err();
        assert!(matches!(err, SequenceError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn test_next_sequence_from_storage() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("Files/LandingZone/Customers");
        std::fs::create_dir_all(folder.join("_ProcessedFiles")).unwrap();
        std::fs::write(folder.join("_metadata.json"), br#"{"keyColumns":["Id"]}"#).unwrap();
        std::fs::write(folder.join(data_file_name(1)), b"PAR1").unwrap();
        std::fs::write(folder.join(data_file_name(2)), b"PAR1").unwrap();
        std::fs::write(folder.join(data_file_name(3)), b"").unwrap();

        let allocator = SequenceAllocator::new(landing(&dir).await);
        assert_eq!(allocator.next_sequence(&customers()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_metadata_only_folder_starts_at_one() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("Files/LandingZone/Customers");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("_metadata.json"), br#"{"keyColumns":["Id"]}"#).unwrap();

        let allocator = SequenceAllocator::new(landing(&dir).await);
        assert_eq!(allocator.next_sequence(&customers()).await.unwrap(), 1);
    }
}
