//! floe: Fabric Open Mirroring landing-zone writer.
//!
//! This crate handles:
//! - Polling change sources (SQL Server change tracking, CSV and Excel snapshot diffs)
//! - Writing each batch as a Parquet data file with row markers into the
//!   table's landing-zone folder, published atomically under the next sequence number
//! - Persisting per-table watermarks once a batch is visible
//! - Cleaning consumer control folders

pub mod batch;
pub mod config;
pub mod error;
pub mod format;
pub mod janitor;
pub mod landing;
pub mod metadata;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod sequence;
pub mod source;
pub mod watermark;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use batch::{ChangeBatch, ChangeRow, Column, ColumnType, RowMarker, TableSchema, Value};
pub use config::{Config, TableKey};
pub use error::{ErrorKind, MirrorError};
pub use landing::{LandingZone, MirroredTable};
pub use pipeline::{MirrorPipeline, MirrorProcessor, MirrorSettings};
pub use source::{ChangeSource, SourcePoll};
pub use watermark::{Watermark, WatermarkRecord, WatermarkStore};

pub use floe_core::{
    Application, CliArgs, NamespaceKind, StorageProvider, StorageProviderRef, init_tracing,
};
