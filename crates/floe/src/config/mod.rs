//! Configuration for the landing-zone writer.

mod table_key;

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use floe_core::config::{
    ConfigPath, GlobalConfig, InterpolationResult, Mergeable, MetricsConfig, Resource,
    interpolate, load_from_paths,
};
pub use floe_core::{NamespaceKind, ParquetCompression};
pub use table_key::TableKey;

use floe_core::error::ConfigError;
use floe_core::storage::BackendConfig;

use crate::landing::MirroredTable;

/// Suffix Fabric appends to mirrored database items in OneLake paths.
const MIRRORED_DATABASE_SUFFIX: &str = ".MountedRelationalDatabase";

fn default_poll_interval() -> u64 {
    10
}

fn default_max_rows_per_file() -> usize {
    1_000_000
}

fn default_source_schema() -> String {
    "dbo".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_cache_ttl() -> u64 {
    86_400
}

fn default_true() -> bool {
    true
}

fn default_janitor_interval() -> u64 {
    3_600
}

/// Where the mirrored database's landing zone lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LandingZoneConfig {
    /// URI of the mirrored database root; tables land under `Files/LandingZone/`.
    #[serde(default)]
    pub uri: String,
    /// Overrides the namespace the URI implies.
    #[serde(default)]
    pub namespace: Option<NamespaceKind>,
    /// Passed to the object store builder (credentials, endpoints).
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Where per-table watermarks are persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JanitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_janitor_interval(),
        }
    }
}

/// Where a table's changes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SourceConfig {
    /// SQL Server table with change tracking enabled.
    SqlChangeTracking {
        /// ADO.NET connection string.
        connection_string: String,
        #[serde(default = "default_source_schema")]
        source_schema: String,
        /// Defaults to the mirrored table name.
        #[serde(default)]
        source_table: Option<String>,
    },
    /// CSV snapshot with a header row.
    Csv {
        path: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_cache_ttl")]
        cache_ttl_secs: u64,
        #[serde(default)]
        emit_deletes: bool,
    },
    /// Excel workbook sheet with a header row.
    Excel {
        path: PathBuf,
        /// Defaults to the first sheet.
        #[serde(default)]
        sheet: Option<String>,
        #[serde(default = "default_cache_ttl")]
        cache_ttl_secs: u64,
        #[serde(default)]
        emit_deletes: bool,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::SqlChangeTracking { .. } => "sql_change_tracking",
            SourceConfig::Csv { .. } => "csv",
            SourceConfig::Excel { .. } => "excel",
        }
    }

    fn validate(&self, table: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSource {
            table: table.to_string(),
            reason: reason.to_string(),
        };

        match self {
            SourceConfig::SqlChangeTracking {
                connection_string,
                source_table,
                ..
            } => {
                if !cfg!(feature = "mssql") {
                    return Err(invalid("built without the mssql feature"));
                }
                if connection_string.trim().is_empty() {
                    return Err(invalid("connection_string cannot be empty"));
                }
                if source_table.as_deref().is_some_and(str::is_empty) {
                    return Err(invalid("source_table cannot be empty"));
                }
            }
            SourceConfig::Csv {
                path,
                delimiter,
                cache_ttl_secs,
                ..
            } => {
                if path.as_os_str().is_empty() {
                    return Err(invalid("path cannot be empty"));
                }
                if !delimiter.is_ascii() {
                    return Err(invalid("delimiter must be a single ASCII character"));
                }
                if *cache_ttl_secs == 0 {
                    return Err(invalid("cache_ttl_secs must be greater than 0"));
                }
            }
            SourceConfig::Excel {
                path,
                cache_ttl_secs,
                ..
            } => {
                if !cfg!(feature = "excel") {
                    return Err(invalid("built without the excel feature"));
                }
                if path.as_os_str().is_empty() {
                    return Err(invalid("path cannot be empty"));
                }
                if *cache_ttl_secs == 0 {
                    return Err(invalid("cache_ttl_secs must be greater than 0"));
                }
            }
        }
        Ok(())
    }
}

/// Configuration for one mirrored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Destination table name; defaults to the table key.
    #[serde(default)]
    pub table: Option<String>,
    /// Destination schema; tables without one land directly under `LandingZone/`.
    #[serde(default)]
    pub schema: Option<String>,
    /// Columns that uniquely identify a row, written to `_metadata.json`.
    pub key_columns: Vec<String>,
    /// Poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Larger batches are split into consecutive data files.
    #[serde(default = "default_max_rows_per_file")]
    pub max_rows_per_file: usize,
    #[serde(default)]
    pub compression: ParquetCompression,
    pub source: SourceConfig,
}

impl TableConfig {
    pub fn table_name<'a>(&'a self, key: &'a TableKey) -> &'a str {
        self.table.as_deref().unwrap_or(key.id())
    }

    pub fn mirrored_table(&self, key: &TableKey, workspace: &str, database: &str) -> MirroredTable {
        MirroredTable::new(
            workspace,
            database,
            self.schema.clone(),
            self.table_name(key),
        )
    }

    fn validate(&self, key: &TableKey) -> Result<(), ConfigError> {
        let table = key.id().to_string();
        let setting = |field: &str, reason: &str| ConfigError::InvalidTableSetting {
            table: table.clone(),
            field: field.to_string(),
            reason: reason.to_string(),
        };

        let name = self.table_name(key);
        if name.is_empty() || name.contains('/') {
            return Err(setting("table", "must be a non-empty name without '/'"));
        }
        if self.schema.as_deref().is_some_and(|s| s.contains('/')) {
            return Err(setting("schema", "cannot contain '/'"));
        }

        if self.key_columns.is_empty() {
            return Err(ConfigError::NoKeyColumns {
                table: key.id().to_string(),
            });
        }
        for (i, column) in self.key_columns.iter().enumerate() {
            if column.is_empty() {
                return Err(setting("key_columns", "column names cannot be empty"));
            }
            if self.key_columns[..i].contains(column) {
                return Err(ConfigError::DuplicateKeyColumn {
                    table: key.id().to_string(),
                    column: column.clone(),
                });
            }
        }

        if self.max_rows_per_file == 0 {
            return Err(setting("max_rows_per_file", "must be greater than 0"));
        }
        if self.poll_interval_secs == 0 {
            return Err(setting("poll_interval_secs", "must be greater than 0"));
        }

        self.source.validate(key.id())
    }
}

/// Main configuration for floe.
///
/// # Example
///
/// ```yaml
/// landing_zone:
///   uri: abfss://Sales@onelake.dfs.fabric.microsoft.com/Mirror.MountedRelationalDatabase
/// state:
///   uri: /var/lib/floe
/// tables:
///   customers:
///     table: Customers
///     schema: dbo
///     key_columns: [CustomerId]
///     source:
///       type: sql_change_tracking
///       connection_string: ${SQL_CONNECTION}
///   prices:
///     key_columns: [Sku]
///     source:
///       type: csv
///       path: /data/prices.csv
///
/// global:
///   total_concurrency: 4
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub landing_zone: LandingZoneConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    /// Named table configurations.
    #[serde(default)]
    pub tables: IndexMap<TableKey, TableConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Take `theirs` unless both files set the section to different values.
fn merge_section<T: PartialEq + Default>(
    section: &str,
    ours: &mut T,
    theirs: T,
) -> Result<(), ConfigError> {
    if theirs == T::default() {
        return Ok(());
    }
    if *ours != T::default() && *ours != theirs {
        return Err(ConfigError::ConflictingSection {
            section: section.to_string(),
        });
    }
    *ours = theirs;
    Ok(())
}

impl Mergeable for Config {
    type Key = TableKey;
    type Component = TableConfig;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component> {
        &self.tables
    }

    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component> {
        &mut self.tables
    }

    fn global(&self) -> &GlobalConfig {
        &self.global
    }

    fn global_mut(&mut self) -> &mut GlobalConfig {
        &mut self.global
    }

    fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut MetricsConfig {
        &mut self.metrics
    }

    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::YamlParse { source })
    }

    fn merge_sections(&mut self, other: &mut Self) -> Result<(), ConfigError> {
        merge_section(
            "landing_zone",
            &mut self.landing_zone,
            std::mem::take(&mut other.landing_zone),
        )?;
        merge_section("state", &mut self.state, std::mem::take(&mut other.state))?;
        merge_section(
            "janitor",
            &mut self.janitor,
            std::mem::take(&mut other.janitor),
        )
    }
}

impl Config {
    /// Load configuration from multiple paths (files or directories).
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Self = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let result = interpolate(contents);
        if !result.is_ok() {
            return Err(ConfigError::EnvInterpolation {
                message: result.errors.join("\n"),
            });
        }

        let config: Config = serde_yaml::from_str(&result.text)
            .map_err(|source| ConfigError::YamlParse { source })?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Checks:
    /// - landing zone and state URIs are set and name a supported backend
    /// - every table has unique, non-empty key columns and usable limits
    /// - no two tables share a landing-zone folder or watermark file
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.landing_zone.uri.trim().is_empty() {
            return Err(ConfigError::EmptyLandingZoneUri);
        }
        if self.state.uri.trim().is_empty() {
            return Err(ConfigError::EmptyStateUri);
        }
        self.database_location()?;
        BackendConfig::parse_url(&self.state.uri).map_err(|source| {
            ConfigError::InvalidStorageUri {
                field: "state.uri".to_string(),
                source,
            }
        })?;

        if self.janitor.enabled && self.janitor.interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "janitor.interval_secs".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        for (key, table) in &self.tables {
            table.validate(key)?;
        }

        let conflicts = Resource::conflicts(
            self.tables
                .iter()
                .map(|(key, table)| (key.id().to_string(), self.resources(key, table))),
        );

        if !conflicts.is_empty() {
            let message = conflicts
                .iter()
                .map(|(resource, keys)| {
                    let mut keys_list: Vec<_> = keys.iter().collect();
                    keys_list.sort();
                    format!("{} claimed by: {:?}", resource, keys_list)
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConfigError::ResourceConflict { message });
        }

        Ok(())
    }

    /// Exclusive resources a table claims: its landing-zone folder and its
    /// watermark document.
    pub fn resources(&self, key: &TableKey, table: &TableConfig) -> Vec<Resource> {
        let landing = table.mirrored_table(key, "", "").landing_path();
        vec![
            Resource::directory(&format!(
                "{}/{}",
                self.landing_zone.uri.trim_end_matches('/'),
                landing
            )),
            Resource::file(&format!(
                "{}/{}.watermark.json",
                self.state.uri.trim_end_matches('/'),
                key.file_stem()
            )),
        ]
    }

    /// Workspace and mirrored database names implied by the landing-zone URI.
    ///
    /// OneLake and ADLS URIs yield the container and the last path segment
    /// (without `.MountedRelationalDatabase`); local paths yield `local` and
    /// the directory name.
    pub fn database_location(&self) -> Result<(String, String), ConfigError> {
        let backend = BackendConfig::parse_url(&self.landing_zone.uri).map_err(|source| {
            ConfigError::InvalidStorageUri {
                field: "landing_zone.uri".to_string(),
                source,
            }
        })?;

        let (workspace, item) = match &backend {
            BackendConfig::Azure(azure) => (
                azure.container.clone(),
                azure
                    .key
                    .as_ref()
                    .and_then(|key| key.filename())
                    .unwrap_or(azure.container.as_str())
                    .to_string(),
            ),
            BackendConfig::Local(local) => (
                "local".to_string(),
                std::path::Path::new(&local.path)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("local")
                    .to_string(),
            ),
        };

        let database = item
            .strip_suffix(MIRRORED_DATABASE_SUFFIX)
            .map(str::to_string)
            .unwrap_or(item);
        Ok((workspace, database))
    }

    /// Iterate over all tables with their keys.
    pub fn tables(&self) -> impl Iterator<Item = (&TableKey, &TableConfig)> {
        self.tables.iter()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}
