//! SQL Server change tracking as a change source.
//!
//! The first poll, and any poll whose stored version has fallen out of the
//! change-tracking retention window, is a full snapshot. Every other poll
//! asks for changes after the stored version. The new watermark is the
//! source's current version read *before* the extract, so rows committed
//! while the extract runs are captured again on the next poll rather than
//! missed.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::batch::ChangeBatch;
use crate::error::SourceError;
use crate::watermark::Watermark;

use super::{ChangeSource, SourcePoll};

/// Queries a change-tracked table.
///
/// `MssqlClient` (feature `mssql`) talks to SQL Server; tests supply
/// in-memory implementations.
#[async_trait]
pub trait ChangeTrackingClient: Send {
    /// Qualified source table name, for messages.
    fn table(&self) -> String;

    /// `CHANGE_TRACKING_CURRENT_VERSION()`; `None` if change tracking is off.
    async fn current_version(&mut self) -> Result<Option<i64>, SourceError>;

    /// `CHANGE_TRACKING_MIN_VALID_VERSION(...)` for the table; `None` if the
    /// table is not tracked.
    async fn min_valid_version(&mut self) -> Result<Option<i64>, SourceError>;

    /// Every row, tagged as an upsert.
    async fn snapshot(&mut self) -> Result<ChangeBatch, SourceError>;

    /// Net changes after `version`: current values for inserted or updated
    /// keys, key-only delete rows for removed keys.
    async fn changes_since(&mut self, version: i64) -> Result<ChangeBatch, SourceError>;
}

pub struct SqlChangeTracking<C> {
    client: C,
}

impl<C: ChangeTrackingClient> SqlChangeTracking<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn disabled(&self) -> SourceError {
        SourceError::ChangeTrackingDisabled {
            table: self.client.table(),
        }
    }
}

#[async_trait]
impl<C: ChangeTrackingClient> ChangeSource for SqlChangeTracking<C> {
    fn kind(&self) -> &'static str {
        "sql_change_tracking"
    }

    async fn poll(&mut self, watermark: Option<&Watermark>) -> Result<SourcePoll, SourceError> {
        let current = self
            .client
            .current_version()
            .await?
            .ok_or_else(|| self.disabled())?;

        let batch = match watermark {
            None => {
                debug!(table = %self.client.table(), version = current, "No watermark, taking full snapshot");
                self.client.snapshot().await?
            }
            Some(Watermark::Version(version)) => {
                let min_valid = self
                    .client
                    .min_valid_version()
                    .await?
                    .ok_or_else(|| self.disabled())?;

                if *version < min_valid {
                    warn!(
                        table = %self.client.table(),
                        watermark = version,
                        min_valid,
                        "Watermark is older than change-tracking retention, taking full snapshot"
                    );
                    self.client.snapshot().await?
                } else {
                    self.client.changes_since(*version).await?
                }
            }
            Some(other) => {
                return Err(SourceError::UnsupportedWatermark {
                    found: other.to_string(),
                    source_kind: self.kind().to_string(),
                });
            }
        };

        Ok(SourcePoll {
            batch,
            watermark: Watermark::Version(current),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ChangeRow, Column, ColumnType, RowMarker, TableSchema, Value};
    use std::collections::BTreeMap;

    /// Single-table change tracking over a map.
    #[derive(Default)]
    struct FakeTable {
        rows: BTreeMap<i64, String>,
        log: Vec<(i64, i64)>,
        version: i64,
        min_valid: i64,
        enabled: bool,
    }

    impl FakeTable {
        fn new() -> Self {
            Self {
                enabled: true,
                ..Default::default()
            }
        }

        fn schema() -> TableSchema {
            TableSchema::new(vec![
                Column::new("Id", ColumnType::Int64),
                Column::new("Name", ColumnType::Utf8),
            ])
            .unwrap()
        }

        fn upsert(&mut self, id: i64, name: &str) {
            self.version += 1;
            self.rows.insert(id, name.to_string());
            self.log.push((self.version, id));
        }

        fn delete(&mut self, id: i64) {
            self.version += 1;
            self.rows.remove(&id);
            self.log.push((self.version, id));
        }
    }

    #[async_trait]
    impl ChangeTrackingClient for FakeTable {
        fn table(&self) -> String {
            "dbo.People".to_string()
        }

        async fn current_version(&mut self) -> Result<Option<i64>, SourceError> {
            Ok(self.enabled.then_some(self.version))
        }

        async fn min_valid_version(&mut self) -> Result<Option<i64>, SourceError> {
            Ok(self.enabled.then_some(self.min_valid))
        }

        async fn snapshot(&mut self) -> Result<ChangeBatch, SourceError> {
            let rows = self
                .rows
                .iter()
                .map(|(id, name)| vec![Value::Int64(*id), Value::Utf8(name.clone())])
                .collect();
            Ok(ChangeBatch::snapshot(Self::schema(), rows))
        }

        async fn changes_since(&mut self, version: i64) -> Result<ChangeBatch, SourceError> {
            let mut keys: Vec<i64> = self
                .log
                .iter()
                .filter(|(v, _)| *v > version)
                .map(|(_, id)| *id)
                .collect();
            keys.sort();
            keys.dedup();

            let rows = keys
                .into_iter()
                .map(|id| match self.rows.get(&id) {
                    Some(name) => ChangeRow::upsert(vec![Value::Int64(id), Value::Utf8(name.clone())]),
                    None => ChangeRow::delete(vec![Value::Int64(id), Value::Null]),
                })
                .collect();
            Ok(ChangeBatch::new(Self::schema(), rows))
        }
    }

    fn seeded() -> FakeTable {
        let mut table = FakeTable::new();
        table.upsert(1, "Ada");
        table.upsert(2, "Grace");
        table.upsert(3, "Edsger");
        table
    }

    #[tokio::test]
    async fn test_first_poll_is_full_snapshot() {
        let mut source = SqlChangeTracking::new(seeded());

        let poll = source.poll(None).await.unwrap();
        assert_eq!(poll.batch.len(), 3);
        assert_eq!(poll.batch.count(RowMarker::Upsert), 3);
        assert_eq!(poll.watermark, Watermark::Version(3));
    }

    #[tokio::test]
    async fn test_delete_after_snapshot_is_single_delete_row() {
        let mut source = SqlChangeTracking::new(seeded());
        let first = source.poll(None).await.unwrap();

        source.client.delete(2);
        let second = source.poll(Some(&first.watermark)).await.unwrap();

        assert_eq!(second.batch.len(), 1);
        let row = &second.batch.rows()[0];
        assert_eq!(row.marker, RowMarker::Delete);
        assert_eq!(row.values[0], Value::Int64(2));
        assert_eq!(second.watermark, Watermark::Version(4));
    }

    #[tokio::test]
    async fn test_no_changes_still_advances_to_current_version() {
        let mut source = SqlChangeTracking::new(seeded());
        let poll = source.poll(Some(&Watermark::Version(3))).await.unwrap();
        assert!(poll.batch.is_empty());
        assert_eq!(poll.batch.schema().len(), 2);
        assert_eq!(poll.watermark, Watermark::Version(3));
    }

    #[tokio::test]
    async fn test_expired_watermark_falls_back_to_snapshot() {
        let mut table = seeded();
        table.min_valid = 3;
        let mut source = SqlChangeTracking::new(table);

        let poll = source.poll(Some(&Watermark::Version(1))).await.unwrap();
        assert_eq!(poll.batch.len(), 3);
        assert_eq!(poll.batch.count(RowMarker::Upsert), 3);
    }

    #[tokio::test]
    async fn test_change_tracking_disabled() {
        let mut table = seeded();
        table.enabled = false;
        let mut source = SqlChangeTracking::new(table);

        let err = source.poll(None).await.unwrap_err();
        assert!(matches!(err, SourceError::ChangeTrackingDisabled { .. }));
    }

    #[tokio::test]
    async fn test_content_hash_watermark_rejected() {
        let mut source = SqlChangeTracking::new(seeded());
        let err = source
            .poll(Some(&Watermark::ContentHash("abc".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedWatermark { .. }));
    }
}
