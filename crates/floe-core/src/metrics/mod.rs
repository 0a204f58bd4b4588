//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::{init_global, init_test};

/// Emit a metric event (Vector-style pattern).
///
/// ```ignore
/// use floe_core::metrics::events::{StorageOperation, StorageRequest, RequestStatus};
///
/// emit!(StorageRequest { operation: StorageOperation::Put, status: RequestStatus::Success });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
