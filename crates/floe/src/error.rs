//! Error types for the landing-zone writer.
//!
//! Every error maps onto an [`ErrorKind`]. Only [`ErrorKind::TransientIo`]
//! is retried; everything else stops the affected table's loop and leaves
//! the other tables running.

use std::fmt;

use snafu::prelude::*;

pub use floe_core::error::{ConfigError, StorageError, Transient};

/// How the orchestrator reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network or storage hiccup. Retried with backoff, watermark unchanged.
    TransientIo,
    /// Source schema no longer matches what the table has already published.
    SchemaMismatch,
    /// The landing-zone folder for the table is missing.
    TableNotFound,
    /// Credentials rejected by the source or the landing zone.
    SourceAuth,
    /// Configuration or invariant violation.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::TableNotFound => "table_not_found",
            ErrorKind::SourceAuth => "source_auth",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn storage_kind(e: &StorageError) -> ErrorKind {
    if e.is_auth() {
        ErrorKind::SourceAuth
    } else if e.is_transient() {
        ErrorKind::TransientIo
    } else {
        ErrorKind::Fatal
    }
}

/// Errors from scanning a table folder for the next sequence number.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SequenceError {
    #[snafu(display("Failed to list {path}: {source}"))]
    List { path: String, source: StorageError },

    #[snafu(display("Landing-zone folder {path} does not exist; table metadata must be created first"))]
    TableNotFound { path: String },
}

impl SequenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SequenceError::List { source, .. } => storage_kind(source),
            SequenceError::TableNotFound { .. } => ErrorKind::TableNotFound,
        }
    }
}

/// Errors from turning rows into a columnar data file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FormatError {
    #[snafu(display("Schema changed for an already published table: expected [{expected}], found [{found}]"))]
    SchemaMismatch { expected: String, found: String },

    #[snafu(display("Column {column} expects {expected} but row {row} holds {found}"))]
    ValueType {
        column: String,
        expected: String,
        found: String,
        row: usize,
    },

    #[snafu(display("Row {row} has {found} values, schema has {expected} columns"))]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[snafu(display("Arrow error: {source}"))]
    Arrow { source: arrow::error::ArrowError },

    #[snafu(display("Parquet error: {source}"))]
    Parquet {
        source: parquet::errors::ParquetError,
    },
}

impl FormatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FormatError::SchemaMismatch { .. } | FormatError::ValueType { .. } => {
                ErrorKind::SchemaMismatch
            }
            _ => ErrorKind::Fatal,
        }
    }
}

/// Errors from the temp-then-rename publish protocol.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PublishError {
    #[snafu(display("Failed to serialize {file}: {source}"))]
    Write { file: String, source: FormatError },

    #[snafu(display("Failed to upload temp object {path}: {source}"))]
    Upload { path: String, source: StorageError },

    /// Another writer already published this sequence number.
    #[snafu(display("Sequence conflict: {path} already exists"))]
    SequenceConflict { path: String },

    #[snafu(display("Failed to move {from} to {to}: {source}"))]
    Finalize {
        from: String,
        to: String,
        source: StorageError,
    },

    #[snafu(display("Failed to sweep temp objects under {path}: {source}"))]
    Sweep { path: String, source: StorageError },
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PublishError::Write { source, .. } => source.kind(),
            PublishError::SequenceConflict { .. } => ErrorKind::TransientIo,
            PublishError::Upload { source, .. }
            | PublishError::Finalize { source, .. }
            | PublishError::Sweep { source, .. } => storage_kind(source),
        }
    }
}

/// Errors from writing `_metadata.json`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetadataError {
    #[snafu(display("Failed to encode table metadata: {source}"))]
    EncodeMetadata { source: serde_json::Error },

    #[snafu(display("Failed to decode table metadata at {path}: {source}"))]
    DecodeMetadata {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to write {path}: {source}"))]
    WriteMetadata { path: String, source: StorageError },

    #[snafu(display("Failed to read {path}: {source}"))]
    ReadMetadata { path: String, source: StorageError },
}

impl MetadataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetadataError::WriteMetadata { source, .. } | MetadataError::ReadMetadata { source, .. } => {
                storage_kind(source)
            }
            _ => ErrorKind::Fatal,
        }
    }
}

/// Errors from reading a change source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    #[snafu(display("Failed to read {path}: {source}"))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse CSV snapshot {path}: {source}"))]
    Csv { path: String, source: csv::Error },

    #[cfg(feature = "excel")]
    #[snafu(display("Failed to read workbook {path}: {source}"))]
    Excel {
        path: String,
        source: calamine::Error,
    },

    #[cfg(feature = "mssql")]
    #[snafu(display("SQL Server error: {source}"))]
    Sql { source: tiberius::error::Error },

    #[cfg(feature = "mssql")]
    #[snafu(display("Failed to connect to SQL Server at {addr}: {source}"))]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[snafu(display("Sheet {sheet} not found in {path}"))]
    MissingSheet { path: String, sheet: String },

    #[snafu(display("Snapshot {path} has no header row"))]
    MissingHeader { path: String },

    #[snafu(display("Duplicate column {column} in source"))]
    DuplicateColumn { column: String },

    #[snafu(display("Key column {column} not present in source columns"))]
    MissingKeyColumn { column: String },

    #[snafu(display("Change tracking is not enabled for {table}"))]
    ChangeTrackingDisabled { table: String },

    #[snafu(display("Source table {table} has no columns or does not exist"))]
    SourceTableMissing { table: String },

    #[snafu(display("Stored watermark {found} cannot resume a {source_kind} source"))]
    UnsupportedWatermark { found: String, source_kind: String },

    #[snafu(display("Snapshot parser task failed: {source}"))]
    Blocking { source: tokio::task::JoinError },
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::ReadFile { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::SourceAuth,
                _ => ErrorKind::TransientIo,
            },
            #[cfg(feature = "mssql")]
            SourceError::Sql { source } => crate::source::mssql::classify(source),
            #[cfg(feature = "mssql")]
            SourceError::Connect { .. } => ErrorKind::TransientIo,
            SourceError::Blocking { .. } => ErrorKind::TransientIo,
            SourceError::MissingKeyColumn { .. } | SourceError::DuplicateColumn { .. } => {
                ErrorKind::SchemaMismatch
            }
            SourceError::SourceTableMissing { .. } => ErrorKind::TableNotFound,
            _ => ErrorKind::Fatal,
        }
    }
}

/// Errors from the watermark store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WatermarkError {
    #[snafu(display("Failed to read watermark {path}: {source}"))]
    ReadWatermark { path: String, source: StorageError },

    #[snafu(display("Failed to write watermark {path}: {source}"))]
    WriteWatermark { path: String, source: StorageError },

    #[snafu(display("Corrupt watermark {path}: {source}"))]
    DecodeWatermark {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to encode watermark: {source}"))]
    EncodeWatermark { source: serde_json::Error },

    #[snafu(display("Watermark {path} has unsupported schema version {found}"))]
    UnsupportedVersion { path: String, found: u32 },
}

impl WatermarkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WatermarkError::ReadWatermark { source, .. }
            | WatermarkError::WriteWatermark { source, .. } => storage_kind(source),
            _ => ErrorKind::Fatal,
        }
    }
}

/// Errors from removing control folders.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum JanitorError {
    #[snafu(display("Failed to list {path}: {source}"))]
    ListControl { path: String, source: StorageError },

    #[snafu(display("Failed to delete {path}: {source}"))]
    DeleteControl { path: String, source: StorageError },
}

impl JanitorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JanitorError::ListControl { source, .. } | JanitorError::DeleteControl { source, .. } => {
                storage_kind(source)
            }
        }
    }
}

/// Top-level error for one table's loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MirrorError {
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("Sequence error: {source}"))]
    Sequence { source: SequenceError },

    #[snafu(display("Publish error: {source}"))]
    Publish { source: PublishError },

    #[snafu(display("Format error: {source}"))]
    Format { source: FormatError },

    #[snafu(display("Metadata error: {source}"))]
    Metadata { source: MetadataError },

    #[snafu(display("Source error: {source}"))]
    Source { source: SourceError },

    #[snafu(display("Watermark error: {source}"))]
    Watermark { source: WatermarkError },

    #[snafu(display("Janitor error: {source}"))]
    Janitor { source: JanitorError },

    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },
}

impl MirrorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::Storage { source } => storage_kind(source),
            MirrorError::Sequence { source } => source.kind(),
            MirrorError::Publish { source } => source.kind(),
            MirrorError::Format { source } => source.kind(),
            MirrorError::Metadata { source } => source.kind(),
            MirrorError::Source { source } => source.kind(),
            MirrorError::Watermark { source } => source.kind(),
            MirrorError::Janitor { source } => source.kind(),
            MirrorError::Config { .. } => ErrorKind::Fatal,
        }
    }
}

impl Transient for MirrorError {
    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}

macro_rules! impl_from {
    ($($error:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$error> for MirrorError {
                fn from(source: $error) -> Self {
                    MirrorError::$variant { source }
                }
            }
        )*
    };
}

impl_from! {
    StorageError => Storage,
    SequenceError => Sequence,
    PublishError => Publish,
    FormatError => Format,
    MetadataError => Metadata,
    SourceError => Source,
    WatermarkError => Watermark,
    JanitorError => Janitor,
    ConfigError => Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic_storage() -> StorageError {
        StorageError::ObjectStore {
            source: object_store::Error::Generic {
                store: "MicrosoftAzure",
                source: "connection reset".into(),
            },
        }
    }

    #[test]
    fn test_sequence_conflict_is_transient() {
        let err: MirrorError = PublishError::SequenceConflict {
            path: "Files/LandingZone/Orders/00000000000000000002.parquet".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(err.is_transient());
    }

    #[test]
    fn test_schema_mismatch_is_not_retried() {
        let err: MirrorError = FormatError::SchemaMismatch {
            expected: "Id: Int64".into(),
            found: "Id: Utf8".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_missing_table_folder() {
        let err: MirrorError = SequenceError::TableNotFound {
            path: "Files/LandingZone/Orders".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
    }

    #[test]
    fn test_storage_hiccup_during_upload_is_transient() {
        let err = PublishError::Upload {
            path: "_x.temp".into(),
            source: generic_storage(),
        };
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[test]
    fn test_unreadable_source_file() {
        let denied = SourceError::ReadFile {
            path: "/data/customers.csv".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(denied.kind(), ErrorKind::SourceAuth);

        let missing = SourceError::ReadFile {
            path: "/data/customers.csv".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(missing.kind(), ErrorKind::TransientIo);
    }

    #[test]
    fn test_missing_key_column_is_schema_mismatch() {
        let err = SourceError::MissingKeyColumn {
            column: "CustomerId".into(),
        };
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }
}
