//! Internal events for writer metrics emission.
//!
//! Each event struct represents a measurable occurrence in one table's
//! mirroring loop or in the janitor.

use metrics::{counter, gauge};
use tracing::trace;

pub use floe_core::metrics::events::InternalEvent;

use crate::batch::RowMarker;
use crate::error::ErrorKind;

// ============================================================================
// Capture and publish events
// ============================================================================

/// Rows handed over by a change source, by marker.
pub struct RowsCaptured {
    pub table: String,
    pub marker: RowMarker,
    pub count: usize,
}

impl InternalEvent for RowsCaptured {
    fn emit(self) {
        trace!(table = %self.table, marker = self.marker.as_str(), count = self.count, "Rows captured");
        counter!(
            "floe_rows_captured_total",
            "table" => self.table,
            "marker" => self.marker.as_str()
        )
        .increment(self.count as u64);
    }
}

/// A data file became visible under its final name.
pub struct DataFilePublished {
    pub table: String,
    pub bytes: usize,
}

impl InternalEvent for DataFilePublished {
    fn emit(self) {
        trace!(table = %self.table, bytes = self.bytes, "Data file published");
        counter!("floe_data_files_published_total", "table" => self.table.clone()).increment(1);
        counter!("floe_bytes_published_total", "table" => self.table).increment(self.bytes as u64);
    }
}

/// A poll cycle ended in an error.
///
/// `phase` is where it failed: `recover` (cold-start recovery), `poll`
/// (reading the change source) or `publish` (writing, publishing or
/// committing).
pub struct CycleFailed {
    pub table: String,
    pub phase: &'static str,
    pub kind: ErrorKind,
}

impl InternalEvent for CycleFailed {
    fn emit(self) {
        trace!(table = %self.table, phase = self.phase, kind = %self.kind, "Poll cycle failed");
        counter!(
            "floe_cycle_failures_total",
            "table" => self.table,
            "phase" => self.phase,
            "kind" => self.kind.as_str()
        )
        .increment(1);
    }
}

/// Highest sequence number published for a table.
pub struct LastSequence {
    pub table: String,
    pub sequence: u64,
}

impl InternalEvent for LastSequence {
    fn emit(self) {
        trace!(table = %self.table, sequence = self.sequence, "Last sequence");
        gauge!("floe_last_sequence", "table" => self.table).set(self.sequence as f64);
    }
}

pub struct WatermarkCommitted {
    pub table: String,
}

impl InternalEvent for WatermarkCommitted {
    fn emit(self) {
        trace!(table = %self.table, "Watermark committed");
        counter!("floe_watermark_commits_total", "table" => self.table).increment(1);
    }
}

// ============================================================================
// Table state events
// ============================================================================

/// Per-table orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Idle,
    Polling,
    Writing,
    Publishing,
    Committed,
}

impl TableState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Idle => "idle",
            TableState::Polling => "polling",
            TableState::Writing => "writing",
            TableState::Publishing => "publishing",
            TableState::Committed => "committed",
        }
    }

    fn as_gauge(&self) -> f64 {
        match self {
            TableState::Idle => 0.0,
            TableState::Polling => 1.0,
            TableState::Writing => 2.0,
            TableState::Publishing => 3.0,
            TableState::Committed => 4.0,
        }
    }
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct TableStateChanged {
    pub table: String,
    pub state: TableState,
}

impl InternalEvent for TableStateChanged {
    fn emit(self) {
        trace!(table = %self.table, state = %self.state, "Table state changed");
        gauge!("floe_table_state", "table" => self.table).set(self.state.as_gauge());
    }
}

// ============================================================================
// Housekeeping events
// ============================================================================

/// Objects deleted from a consumer control folder.
pub struct ControlFolderObjectsRemoved {
    pub table: String,
    pub folder: &'static str,
    pub count: usize,
}

impl InternalEvent for ControlFolderObjectsRemoved {
    fn emit(self) {
        trace!(table = %self.table, folder = self.folder, count = self.count, "Control folder objects removed");
        counter!(
            "floe_control_folder_objects_removed_total",
            "table" => self.table,
            "folder" => self.folder
        )
        .increment(self.count as u64);
    }
}

/// Leftover temp objects removed on cold start.
pub struct StaleTempFilesRemoved {
    pub table: String,
    pub count: usize,
}

impl InternalEvent for StaleTempFilesRemoved {
    fn emit(self) {
        trace!(table = %self.table, count = self.count, "Stale temp files removed");
        counter!("floe_stale_temp_files_removed_total", "table" => self.table)
            .increment(self.count as u64);
    }
}
