//! Change sources.
//!
//! A [`ChangeSource`] turns "everything since this watermark" into a
//! [`ChangeBatch`] plus the watermark to store once that batch is published.
//! Polling is a pure read: the orchestrator retries a failed poll with the
//! same watermark.
//!
//! - [`SqlChangeTracking`]: SQL Server `CHANGETABLE(CHANGES ...)`
//! - [`FileDiff`]: content-hash plus row diff over CSV or Excel snapshots

pub mod diff;
#[cfg(feature = "mssql")]
pub mod mssql;
pub mod sql;

use async_trait::async_trait;

use crate::batch::ChangeBatch;
use crate::error::SourceError;
use crate::watermark::Watermark;

pub use diff::{CsvReader, FileDiff, SnapshotCache, SnapshotReader};
#[cfg(feature = "excel")]
pub use diff::ExcelReader;
pub use sql::{ChangeTrackingClient, SqlChangeTracking};

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct SourcePoll {
    pub batch: ChangeBatch,
    /// Cursor to commit after `batch` is published.
    pub watermark: Watermark,
}

#[async_trait]
pub trait ChangeSource: Send {
    /// Short label for logs, e.g. `sql_change_tracking` or `csv_diff`.
    fn kind(&self) -> &'static str;

    /// Changes since `watermark`; a full extract when `watermark` is `None`.
    async fn poll(&mut self, watermark: Option<&Watermark>) -> Result<SourcePoll, SourceError>;
}

#[async_trait]
impl<'a> ChangeSource for Box<dyn ChangeSource + 'a> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    async fn poll(&mut self, watermark: Option<&Watermark>) -> Result<SourcePoll, SourceError> {
        (**self).poll(watermark).await
    }
}
