//! Per-table mirroring loop.
//!
//! One poll cycle walks `Idle -> Polling -> Writing -> Publishing ->
//! Committed -> Idle`. The watermark is committed only after every data file
//! of the batch is visible under its final name, so a crash anywhere before
//! that point replays the batch on restart instead of losing it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use floe_core::{IterationResult, ParquetCompression, PollingProcessor, StorageProviderRef};

use crate::batch::RowMarker;
use crate::config::{TableConfig, TableKey};
use crate::emit;
use crate::error::{MirrorError, Transient};
use crate::format::ParquetFormatWriter;
use crate::landing::{LandingZone, MirroredTable, data_file_name};
use crate::metadata::{MetadataStatus, TableMetadataWriter};
use crate::metrics::events::{
    CycleFailed, DataFilePublished, LastSequence, RowsCaptured, TableState, TableStateChanged,
    WatermarkCommitted,
};
use crate::publish::AtomicPublisher;
use crate::sequence::SequenceAllocator;
use crate::source::{ChangeSource, SourcePoll};
use crate::watermark::{Watermark, WatermarkRecord, WatermarkStore};

/// Per-table knobs taken from [`TableConfig`].
#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub key_columns: Vec<String>,
    pub max_rows_per_file: usize,
    pub compression: ParquetCompression,
}

impl From<&TableConfig> for MirrorSettings {
    fn from(config: &TableConfig) -> Self {
        Self {
            key_columns: config.key_columns.clone(),
            max_rows_per_file: config.max_rows_per_file,
            compression: config.compression,
        }
    }
}

/// A polled batch waiting to be published.
pub struct PreparedBatch {
    poll: SourcePoll,
}

/// Drives one table from its change source into the landing zone.
pub struct MirrorProcessor<S> {
    key: TableKey,
    table: MirroredTable,
    source: S,
    landing: LandingZone,
    format: ParquetFormatWriter,
    sequences: SequenceAllocator,
    publisher: AtomicPublisher,
    metadata: TableMetadataWriter,
    watermarks: WatermarkStore,
    settings: MirrorSettings,
    /// Caps concurrent Writing/Publishing phases across tables.
    global_semaphore: Option<Arc<Semaphore>>,
    /// Last committed watermark, loaded on cold start.
    record: Option<WatermarkRecord>,
    state: TableState,
}

impl<S: ChangeSource> MirrorProcessor<S> {
    pub fn new(
        key: TableKey,
        table: MirroredTable,
        source: S,
        landing: LandingZone,
        state_storage: StorageProviderRef,
        settings: MirrorSettings,
    ) -> Self {
        Self {
            watermarks: WatermarkStore::new(state_storage, key.component()),
            format: ParquetFormatWriter::new(settings.compression),
            sequences: SequenceAllocator::new(landing.clone()),
            publisher: AtomicPublisher::new(landing.clone()),
            metadata: TableMetadataWriter::new(landing.clone()),
            key,
            table,
            source,
            landing,
            settings,
            global_semaphore: None,
            record: None,
            state: TableState::Idle,
        }
    }

    pub fn with_semaphore(mut self, semaphore: Option<Arc<Semaphore>>) -> Self {
        self.global_semaphore = semaphore;
        self
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn table(&self) -> &MirroredTable {
        &self.table
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    /// Last committed watermark record, if any.
    pub fn record(&self) -> Option<&WatermarkRecord> {
        self.record.as_ref()
    }

    fn set_state(&mut self, state: TableState) {
        if self.state != state {
            debug!(target = %self.table, from = %self.state, to = %state, "Table state changed");
        }
        self.state = state;
        emit!(TableStateChanged {
            table: self.table.to_string(),
            state,
        });
    }

    fn last_sequence(&self) -> u64 {
        self.record.as_ref().map_or(0, |r| r.last_sequence)
    }

    fn failed(&mut self, phase: &'static str, error: &MirrorError) {
        self.set_state(TableState::Idle);
        if error.is_transient() {
            warn!(target = %self.table, phase, kind = %error.kind(), error = %error, "Poll cycle failed, will retry");
        }
        emit!(CycleFailed {
            table: self.table.to_string(),
            phase,
            kind: error.kind(),
        });
    }

    /// Cold-start recovery: metadata, leftover temps, watermark and schema lock.
    async fn recover(&mut self) -> Result<(), MirrorError> {
        let status = self
            .metadata
            .ensure(&self.table, &self.settings.key_columns)
            .await?;
        if status == MetadataStatus::AlreadyPresent
            && let Some(existing) = self.metadata.read(&self.table).await?
            && existing.key_columns != self.settings.key_columns
        {
            warn!(
                target = %self.table,
                existing = ?existing.key_columns,
                configured = ?self.settings.key_columns,
                "Existing table metadata has different key columns; keeping it"
            );
        }

        self.publisher.sweep_stale_temps(&self.table).await?;
        self.record = self.watermarks.load().await?;

        let scan = self.sequences.scan(&self.table).await?;
        if let Some(latest) = &scan.latest {
            let data = self.landing.storage().get(latest).await?;
            self.format.seed_from_file(data)?;
            debug!(target = %self.table, file = %latest, "Locked schema from latest data file");
        }

        info!(
            target = %self.table,
            key = %self.key,
            watermark = ?self.record.as_ref().map(|r| r.watermark.to_string()),
            next_sequence = scan.next.max(self.last_sequence() + 1),
            namespace = %self.publisher.namespace(),
            "Recovered table state"
        );
        Ok(())
    }

    async fn poll(&mut self) -> Result<SourcePoll, MirrorError> {
        self.set_state(TableState::Polling);
        let watermark = self.record.as_ref().map(|r| &r.watermark);
        let poll = self.source.poll(watermark).await?;
        poll.batch
            .schema()
            .key_indices(&self.settings.key_columns)?;
        Ok(poll)
    }

    async fn commit(&mut self, watermark: Watermark, last_sequence: u64) -> Result<(), MirrorError> {
        let record = WatermarkRecord::new(self.key.id(), watermark, last_sequence);
        self.watermarks.commit(&record).await?;
        self.record = Some(record);
        emit!(WatermarkCommitted {
            table: self.table.to_string(),
        });
        Ok(())
    }

    async fn publish(&mut self, poll: SourcePoll) -> Result<IterationResult, MirrorError> {
        let SourcePoll { batch, watermark } = poll;

        if batch.is_empty() {
            let unchanged = self.record.as_ref().is_some_and(|r| r.watermark == watermark);
            if !unchanged {
                self.commit(watermark, self.last_sequence()).await?;
                debug!(target = %self.table, "No changes, watermark advanced");
            }
            self.set_state(TableState::Idle);
            return Ok(IterationResult::NoItems);
        }

        // The semaphore is never closed, so a failed acquire only means no cap.
        let _permit = match &self.global_semaphore {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        self.set_state(TableState::Writing);
        let schema = self.format.lock(batch.schema())?;

        let floor = self.last_sequence() + 1;
        let mut sequence = self.sequences.next_sequence(&self.table).await?.max(floor);
        let mut last_sequence = self.last_sequence();
        let mut files = 0usize;

        for (first_ordinal, rows) in batch.chunks(self.settings.max_rows_per_file) {
            self.set_state(TableState::Publishing);
            let file_name = data_file_name(sequence);
            let format = &self.format;
            let table_schema = batch.schema();
            let arrow = schema.clone();

            let published = self
                .publisher
                .publish(&self.table, &file_name, |buf| {
                    format
                        .serialize(table_schema, arrow, rows, first_ordinal, buf)
                        .map(|_| ())
                })
                .await?;

            emit!(DataFilePublished {
                table: self.table.to_string(),
                bytes: published.bytes,
            });
            emit!(LastSequence {
                table: self.table.to_string(),
                sequence,
            });

            last_sequence = sequence;
            sequence += 1;
            files += 1;
        }

        self.commit(watermark, last_sequence).await?;
        self.set_state(TableState::Committed);

        for marker in [RowMarker::Upsert, RowMarker::Delete] {
            emit!(RowsCaptured {
                table: self.table.to_string(),
                marker,
                count: batch.count(marker),
            });
        }

        info!(
            target = %self.table,
            rows = batch.len(),
            files,
            last_sequence,
            "Published batch"
        );

        self.set_state(TableState::Idle);
        Ok(IterationResult::ProcessedItems)
    }
}

#[async_trait]
impl<S: ChangeSource> PollingProcessor for MirrorProcessor<S> {
    type State = PreparedBatch;
    type Error = MirrorError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<PreparedBatch>, MirrorError> {
        if cold_start && let Err(e) = self.recover().await {
            self.failed("recover", &e);
            return Err(e);
        }

        match self.poll().await {
            Ok(poll) => Ok(Some(PreparedBatch { poll })),
            Err(e) => {
                self.failed("poll", &e);
                Err(e)
            }
        }
    }

    async fn process(&mut self, state: PreparedBatch) -> Result<IterationResult, MirrorError> {
        let result = self.publish(state.poll).await;
        if let Err(e) = &result {
            self.failed("publish", e);
        }
        result
    }
}
