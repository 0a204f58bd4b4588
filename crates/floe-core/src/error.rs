//! Error types shared by the floe crates.
//!
//! Storage, configuration and metrics failures live here; the landing-zone
//! writer layers its own errors on top and classifies them through
//! [`Transient`].

use snafu::prelude::*;

/// Errors whose cause may clear up on its own (network blips, throttling,
/// timeouts) report `true` and get retried by the polling loop. Anything else
/// stops the owning loop.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Required regex capture group missing (internal error).
    #[snafu(display("Missing required URL component: {group}"))]
    RegexGroupMissing { group: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// Azure / OneLake configuration error.
    #[snafu(display("Azure configuration error: {source}"))]
    AzureConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, missing path).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::NotFound { .. }
            }
        )
    }

    /// Check if a conditional create / no-clobber operation hit an existing object.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::AlreadyExists { .. }
                    | object_store::Error::Precondition { .. }
            }
        )
    }

    /// Check if the store rejected our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::Unauthenticated { .. }
                    | object_store::Error::PermissionDenied { .. }
            }
        )
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => matches!(
                source,
                object_store::Error::Generic { .. } | object_store::Error::JoinError { .. }
            ),
            StorageError::Io { .. } => true,
            StorageError::InvalidUrl { .. }
            | StorageError::RegexGroupMissing { .. }
            | StorageError::AzureConfig { .. } => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Landing zone URI is empty.
    #[snafu(display("landing_zone.uri cannot be empty"))]
    EmptyLandingZoneUri,

    /// Watermark state URI is empty.
    #[snafu(display("state.uri cannot be empty"))]
    EmptyStateUri,

    /// A URI matches none of the supported storage backends.
    #[snafu(display("{field} is not a supported storage URI: {source}"))]
    InvalidStorageUri { field: String, source: StorageError },

    /// A process-wide setting is unusable.
    #[snafu(display("Invalid {field}: {reason}"))]
    InvalidSetting { field: String, reason: String },

    /// A table declares no key columns.
    #[snafu(display("Table '{table}' must declare at least one key column"))]
    NoKeyColumns { table: String },

    /// A table lists the same key column twice.
    #[snafu(display("Table '{table}' lists key column '{column}' more than once"))]
    DuplicateKeyColumn { table: String, column: String },

    /// A table has an unusable numeric setting.
    #[snafu(display("Table '{table}' has invalid {field}: {reason}"))]
    InvalidTableSetting {
        table: String,
        field: String,
        reason: String,
    },

    /// Source definition is incomplete.
    #[snafu(display("Table '{table}' has an invalid source: {reason}"))]
    InvalidSource { table: String, reason: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Resource conflict detected (two tables targeting the same landing-zone folder).
    #[snafu(display("Resource conflict: {message}"))]
    ResourceConflict { message: String },

    /// Duplicate component keys found across config files.
    #[snafu(display("Duplicate component keys: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    /// Two config files set the same singleton section to different values.
    #[snafu(display("Conflicting '{section}' settings across config files"))]
    ConflictingSection { section: String },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Failed to read configuration directory.
    #[snafu(display("Failed to read directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Metrics server not initialized (controller accessed before init).
    #[snafu(display("Metrics server not initialized"))]
    NotInitialized,
}

// ============ Pipeline Setup Errors ============

/// Errors that can occur during pipeline setup (before running).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineSetupError {
    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Failed to initialize metrics.
    #[snafu(display("Failed to initialize metrics: {source}"))]
    Metrics { source: MetricsError },

    /// Failed to build the async runtime.
    #[snafu(display("Failed to build tokio runtime: {source}"))]
    Runtime { source: std::io::Error },
}
