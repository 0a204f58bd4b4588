//! Per-table change-source cursors.
//!
//! One JSON document per table, `{table_key}.watermark.json`, written with
//! temp-then-rename so a crash leaves either the old or the new record.

use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use floe_core::{ComponentKey, StorageProviderRef};

use crate::error::{
    DecodeWatermarkSnafu, EncodeWatermarkSnafu, ReadWatermarkSnafu, WatermarkError,
    WriteWatermarkSnafu,
};

const SCHEMA_VERSION: u32 = 1;

/// Position in a change source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Watermark {
    /// SQL Server change-tracking version.
    Version(i64),
    /// Hex content hash of a file snapshot.
    ContentHash(String),
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Watermark::Version(v) => write!(f, "version {v}"),
            Watermark::ContentHash(h) => write!(f, "hash {h}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub schema_version: u32,
    pub table: String,
    pub watermark: Watermark,
    /// Highest sequence number published when this record was written, 0 if none.
    pub last_sequence: u64,
    pub committed_at: DateTime<Utc>,
}

impl WatermarkRecord {
    pub fn new(table: impl Into<String>, watermark: Watermark, last_sequence: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            table: table.into(),
            watermark,
            last_sequence,
            committed_at: Utc::now(),
        }
    }
}

/// Watermark persistence for one table.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    storage: StorageProviderRef,
    path: Path,
}

impl WatermarkStore {
    pub fn new(storage: StorageProviderRef, key: &ComponentKey) -> Self {
        let path = Path::from(format!("{}.watermark.json", key.file_stem()));
        Self { storage, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<WatermarkRecord>, WatermarkError> {
        let bytes = match self.storage.get(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => {
                return Err(source).context(ReadWatermarkSnafu {
                    path: self.path.to_string(),
                });
            }
        };

        let record: WatermarkRecord =
            serde_json::from_slice(&bytes).context(DecodeWatermarkSnafu {
                path: self.path.to_string(),
            })?;
        if record.schema_version != SCHEMA_VERSION {
            return Err(WatermarkError::UnsupportedVersion {
                path: self.path.to_string(),
                found: record.schema_version,
            });
        }
        Ok(Some(record))
    }

    pub async fn commit(&self, record: &WatermarkRecord) -> Result<(), WatermarkError> {
        let body = serde_json::to_vec_pretty(record).context(EncodeWatermarkSnafu)?;
        self.storage
            .atomic_write(&self.path, body)
            .await
            .context(WriteWatermarkSnafu {
                path: self.path.to_string(),
            })?;
        debug!(
            target = %record.table,
            watermark = %record.watermark,
            last_sequence = record.last_sequence,
            "Committed watermark"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_core::StorageProvider;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store(dir: &TempDir, key: &str) -> WatermarkStore {
        let storage = StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        WatermarkStore::new(Arc::new(storage), &ComponentKey::new(key))
    }

    #[tokio::test]
    async fn test_missing_watermark() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir, "customers").await.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "dbo.Customers").await;

        let first = WatermarkRecord::new("Sales.dbo.Customers", Watermark::Version(41), 1);
        store.commit(&first).await.unwrap();
        let second = WatermarkRecord::new("Sales.dbo.Customers", Watermark::Version(42), 2);
        store.commit(&second).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(second));
        assert!(dir.path().join("dbo.Customers.watermark.json").exists());
    }

    #[test]
    fn test_watermark_json_shape() {
        let json = serde_json::to_value(Watermark::ContentHash("ab12".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "content_hash", "value": "ab12"}));
        let json = serde_json::to_value(Watermark::Version(7)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "version", "value": 7}));
    }

    #[tokio::test]
    async fn test_unknown_schema_version_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("orders.watermark.json"),
            r#"{"schema_version":9,"table":"t","watermark":{"kind":"version","value":1},"last_sequence":0,"committed_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let err = store(&dir, "orders").await.load().await.unwrap_err();
        assert!(matches!(err, WatermarkError::UnsupportedVersion { found: 9, .. }));
    }
}
