//! Metrics for the landing-zone writer.
//!
//! Per-table events carry a `table` label so multi-table deployments can be
//! told apart on one dashboard.

pub mod events;

pub use events::*;

/// Macro for emitting writer metric events.
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        <_ as $crate::metrics::events::InternalEvent>::emit($event)
    };
}
