//! floe-core: plumbing shared by the floe landing-zone writer.
//!
//! - `storage` - object store access (OneLake, ADLS Gen2, Blob, local) with
//!   the no-clobber primitives atomic publishing needs
//! - `polling` - per-component poll loop with backoff and graceful shutdown
//! - `topology` - runs many independent pipelines in one process
//! - `config` - multi-file YAML loading, env interpolation, shared settings
//! - `metrics` - Prometheus recorder, HTTP endpoint and internal events
//! - `app` - `main` boilerplate

pub mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod signal;
pub mod storage;
pub mod topology;
pub mod tracing;

pub use app::{AppConfig, Application};
pub use config::{
    CliArgs, ComponentKey, GlobalConfig, KB, MB, MetricsConfig, ParquetCompression, Resource,
    RetryConfig,
};
pub use error::{
    ConfigError, MetricsError, PipelineSetupError, StorageError, Transient,
};
pub use metrics::server::{DEFAULT_METRICS_ADDR, MetricsController};
pub use metrics::{init_global as init_metrics, init_test as init_metrics_test};
pub use polling::{IterationResult, PollingProcessor, run_polling_loop};
pub use signal::shutdown_signal;
pub use storage::{DirectoryListing, NamespaceKind, StorageProvider, StorageProviderRef};
pub use topology::{Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines};
pub use tracing::init_tracing;
