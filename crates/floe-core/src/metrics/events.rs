//! Internal events shared by every floe component.
//!
//! Each event struct represents a measurable occurrence; implementing
//! `InternalEvent` maps it onto the corresponding Prometheus metric.
//! Per-table events carry a `target` label.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Head,
    Put,
    Delete,
    List,
    Rename,
    Copy,
    CreateMultipart,
    PutPart,
    CompleteMultipart,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Head => "head",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
            StorageOperation::List => "list",
            StorageOperation::Rename => "rename",
            StorageOperation::Copy => "copy",
            StorageOperation::CreateMultipart => "create_multipart",
            StorageOperation::PutPart => "put_part",
            StorageOperation::CompleteMultipart => "complete_multipart",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "floe_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "floe_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

pub struct ActiveMultipartParts {
    pub count: usize,
}

impl InternalEvent for ActiveMultipartParts {
    fn emit(self) {
        gauge!("floe_active_multipart_parts").set(self.count as f64);
    }
}

pub struct MultipartUploadCompleted;

impl InternalEvent for MultipartUploadCompleted {
    fn emit(self) {
        trace!("Multipart upload completed");
        counter!("floe_multipart_uploads_total").increment(1);
    }
}

// ============================================================================
// Polling loop events
// ============================================================================

/// Outcome of one polling iteration.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
    Failed,
}

impl IterationResultType {
    fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
            IterationResultType::Failed => "failed",
        }
    }
}

/// Event emitted when a polling iteration completes.
pub struct IterationCompleted {
    /// Component kind ("table" or "janitor").
    pub service: &'static str,
    pub result: IterationResultType,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(
            service = self.service,
            result = self.result.as_str(),
            target = %self.target,
            "Iteration completed"
        );
        counter!(
            "floe_polling_iterations_total",
            "service" => self.service,
            "result" => self.result.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Time spent in prepare + process for one iteration.
pub struct IterationDuration {
    pub service: &'static str,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        histogram!(
            "floe_polling_iteration_duration_seconds",
            "service" => self.service,
            "target" => self.target
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Consecutive transient failures for a target; resets to zero on success.
pub struct ConsecutiveFailures {
    pub service: &'static str,
    pub count: u32,
    pub target: String,
}

impl InternalEvent for ConsecutiveFailures {
    fn emit(self) {
        gauge!(
            "floe_polling_consecutive_failures",
            "service" => self.service,
            "target" => self.target
        )
        .set(self.count as f64);
    }
}
