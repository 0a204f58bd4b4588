//! `_metadata.json` descriptor creation.

use bytes::Bytes;
use object_store::PutPayload;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, info};

use crate::error::{
    DecodeMetadataSnafu, EncodeMetadataSnafu, MetadataError, ReadMetadataSnafu,
    WriteMetadataSnafu,
};
use crate::landing::{LandingZone, MirroredTable};

/// Contents of `_metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub key_columns: Vec<String>,
}

/// Outcome of [`TableMetadataWriter::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataStatus {
    Created,
    AlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct TableMetadataWriter {
    landing: LandingZone,
}

impl TableMetadataWriter {
    pub fn new(landing: LandingZone) -> Self {
        Self { landing }
    }

    /// Create `_metadata.json` unless it already exists.
    ///
    /// An existing descriptor is never rewritten, even if its key columns
    /// differ from the configured ones.
    pub async fn ensure(
        &self,
        table: &MirroredTable,
        key_columns: &[String],
    ) -> Result<MetadataStatus, MetadataError> {
        let path = table.metadata_path();
        let body = serde_json::to_vec(&TableMetadata {
            key_columns: key_columns.to_vec(),
        })
        .context(EncodeMetadataSnafu)?;

        match self
            .landing
            .storage()
            .put_if_absent(&path, PutPayload::from(Bytes::from(body)))
            .await
        {
            Ok(()) => {
                info!(target = %table, keys = ?key_columns, "Created table metadata");
                Ok(MetadataStatus::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(target = %table, "Table metadata already present");
                Ok(MetadataStatus::AlreadyPresent)
            }
            Err(source) => Err(source).context(WriteMetadataSnafu {
                path: path.to_string(),
            }),
        }
    }

    /// Read the descriptor back; `None` if the table has none yet.
    pub async fn read(&self, table: &MirroredTable) -> Result<Option<TableMetadata>, MetadataError> {
        let path = table.metadata_path();
        let bytes = match self.landing.storage().get(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(source) => {
                return Err(source).context(ReadMetadataSnafu {
                    path: path.to_string(),
                });
            }
        };

        let metadata = serde_json::from_slice(&bytes).context(DecodeMetadataSnafu {
            path: path.to_string(),
        })?;
        Ok(Some(metadata))
    }
}
