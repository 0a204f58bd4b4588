//! Pipelines for mirroring tables into the landing zone.
//!
//! Every configured table runs its own polling loop over a
//! [`MirrorProcessor`]; one more loop runs the janitor over all tables.
//! Loops share shutdown handling and the optional global concurrency cap.

mod processor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use floe_core::{
    AppConfig, Pipeline, PipelineContext, StorageProvider, StorageProviderRef, run_polling_loop,
};

use crate::config::{Config, ConfigPath, JanitorConfig, SourceConfig, TableConfig, TableKey};
use crate::error::{ConfigError, MirrorError};
use crate::janitor::{JanitorCleaner, JanitorProcessor};
use crate::landing::{LandingZone, MirroredTable};
use crate::source::{ChangeSource, CsvReader, FileDiff, SnapshotCache};

pub use processor::{MirrorProcessor, MirrorSettings, PreparedBatch};

/// Key of the janitor loop in logs.
const JANITOR_KEY: &str = "_janitor";

pub(crate) async fn create_storage(
    url: &str,
    options: HashMap<String, String>,
) -> Result<StorageProviderRef, MirrorError> {
    Ok(Arc::new(
        StorageProvider::for_url_with_options(url, options).await?,
    ))
}

/// Build the change source a table is configured with.
pub fn source_from_config(
    key: &TableKey,
    config: &TableConfig,
) -> Result<Box<dyn ChangeSource>, MirrorError> {
    let key_columns = config.key_columns.clone();

    let source: Box<dyn ChangeSource> = match &config.source {
        #[cfg(feature = "mssql")]
        SourceConfig::SqlChangeTracking {
            connection_string,
            source_schema,
            source_table,
        } => {
            let table = source_table
                .clone()
                .unwrap_or_else(|| config.table_name(key).to_string());
            let client = crate::source::mssql::MssqlClient::new(
                connection_string,
                source_schema.clone(),
                table,
                key_columns,
            )?;
            Box::new(crate::source::SqlChangeTracking::new(client))
        }
        SourceConfig::Csv {
            path,
            delimiter,
            cache_ttl_secs,
            emit_deletes,
        } => {
            let delimiter = u8::try_from(*delimiter).map_err(|_| ConfigError::InvalidSource {
                table: key.id().to_string(),
                reason: "delimiter must be a single ASCII character".to_string(),
            })?;
            Box::new(FileDiff::new(
                CsvReader::new(path, delimiter),
                key_columns,
                SnapshotCache::new(Duration::from_secs(*cache_ttl_secs)),
                *emit_deletes,
            ))
        }
        #[cfg(feature = "excel")]
        SourceConfig::Excel {
            path,
            sheet,
            cache_ttl_secs,
            emit_deletes,
        } => Box::new(FileDiff::new(
            crate::source::ExcelReader::new(path, sheet.clone()),
            key_columns,
            SnapshotCache::new(Duration::from_secs(*cache_ttl_secs)),
            *emit_deletes,
        )),
        #[allow(unreachable_patterns)]
        other => {
            return Err(ConfigError::InvalidSource {
                table: key.id().to_string(),
                reason: format!("{} support is not compiled in", other.kind()),
            }
            .into());
        }
    };
    Ok(source)
}

/// One independently running loop.
pub enum MirrorPipeline {
    Table {
        key: TableKey,
        config: Box<Config>,
        table: TableConfig,
        context: PipelineContext,
    },
    Janitor {
        key: TableKey,
        config: Box<Config>,
        janitor: JanitorConfig,
        context: PipelineContext,
    },
}

impl MirrorPipeline {
    /// Create one pipeline per table, plus the janitor when enabled.
    pub fn from_config(config: &Config, context: PipelineContext) -> Vec<Self> {
        let shared = Box::new(config.clone());
        let mut pipelines: Vec<Self> = config
            .tables()
            .map(|(key, table)| MirrorPipeline::Table {
                key: key.clone(),
                config: shared.clone(),
                table: table.clone(),
                context: context.clone(),
            })
            .collect();

        if config.janitor.enabled && config.table_count() > 0 {
            pipelines.push(MirrorPipeline::Janitor {
                key: TableKey::new(JANITOR_KEY),
                config: shared,
                janitor: config.janitor.clone(),
                context,
            });
        }
        pipelines
    }

    async fn landing_zone(config: &Config) -> Result<LandingZone, MirrorError> {
        let storage = create_storage(
            &config.landing_zone.uri,
            config.landing_zone.storage_options.clone(),
        )
        .await?;
        Ok(LandingZone::new(storage, config.landing_zone.namespace))
    }

    fn mirrored_tables(config: &Config) -> Result<Vec<MirroredTable>, MirrorError> {
        let (workspace, database) = config.database_location()?;
        Ok(config
            .tables()
            .map(|(key, table)| table.mirrored_table(key, &workspace, &database))
            .collect())
    }

    async fn execute_table(
        key: TableKey,
        config: Box<Config>,
        table_config: TableConfig,
        context: PipelineContext,
    ) -> Result<(), MirrorError> {
        let poll_interval = Duration::from_secs(table_config.poll_interval_secs);

        let init = async {
            let (workspace, database) = config.database_location()?;
            let table = table_config.mirrored_table(&key, &workspace, &database);
            let landing = Self::landing_zone(&config).await?;
            let state = create_storage(&config.state.uri, config.state.storage_options.clone())
                .await?;
            let source = source_from_config(&key, &table_config)?;

            Ok::<_, MirrorError>(
                MirrorProcessor::new(
                    key.clone(),
                    table,
                    source,
                    landing,
                    state,
                    MirrorSettings::from(&table_config),
                )
                .with_semaphore(context.global_semaphore.clone()),
            )
        };

        let mut processor = tokio::select! {
            biased;

            _ = context.shutdown.cancelled() => {
                info!(target = %key, "Shutdown requested during initialization");
                return Ok(());
            }

            result = init => result?,
        };

        info!(
            target = %key,
            table = %processor.table(),
            poll_interval_secs = poll_interval.as_secs(),
            "Table processor initialized"
        );

        run_polling_loop(
            &mut processor,
            poll_interval,
            context.poll_jitter_secs,
            &context.retry,
            context.shutdown,
            key.id(),
            "table",
        )
        .await
    }

    async fn execute_janitor(
        key: TableKey,
        config: Box<Config>,
        janitor: JanitorConfig,
        context: PipelineContext,
    ) -> Result<(), MirrorError> {
        let tables = Self::mirrored_tables(&config)?;
        let landing = Self::landing_zone(&config).await?;
        let mut processor = JanitorProcessor::new(JanitorCleaner::new(landing), tables);

        info!(
            target = %key,
            tables = config.table_count(),
            interval_secs = janitor.interval_secs,
            "Janitor initialized"
        );

        run_polling_loop(
            &mut processor,
            Duration::from_secs(janitor.interval_secs),
            context.poll_jitter_secs,
            &context.retry,
            context.shutdown,
            key.id(),
            "janitor",
        )
        .await
    }
}

impl Pipeline for MirrorPipeline {
    type Key = TableKey;
    type Error = MirrorError;

    fn key(&self) -> &Self::Key {
        match self {
            MirrorPipeline::Table { key, .. } | MirrorPipeline::Janitor { key, .. } => key,
        }
    }

    async fn run(self) -> Result<(), Self::Error> {
        match self {
            MirrorPipeline::Table {
                key,
                config,
                table,
                context,
            } => Self::execute_table(key, config, table, context).await,
            MirrorPipeline::Janitor {
                key,
                config,
                janitor,
                context,
            } => Self::execute_janitor(key, config, janitor, context).await,
        }
    }
}

impl AppConfig for Config {
    type Pipeline = MirrorPipeline;

    const COMPONENT_NAME: &'static str = "table";

    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        Config::from_paths(paths)
    }

    fn create_pipelines(&self, context: PipelineContext) -> Vec<Self::Pipeline> {
        MirrorPipeline::from_config(self, context)
    }

    fn log_startup_info(&self) {
        info!(
            "Starting floe landing-zone writer with {} table(s) into {}",
            self.table_count(),
            self.landing_zone.uri
        );
        for (key, table) in self.tables() {
            info!(
                "  Table: {} -> {} ({})",
                key,
                table.table_name(key),
                table.source.kind()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn config(janitor_enabled: bool) -> Config {
        let yaml = format!(
            r#"
landing_zone:
  uri: /tmp/floe-lz/Sales
state:
  uri: /tmp/floe-state
janitor:
  enabled: {janitor_enabled}
tables:
  customers:
    key_columns: [CustomerId]
    source: {{ type: csv, path: /data/customers.csv }}
  orders:
    table: Orders
    schema: sales
    key_columns: [OrderId]
    source: {{ type: csv, path: /data/orders.csv, delimiter: ";" }}
"#
        );
        Config::parse(&yaml).unwrap()
    }

    fn context() -> PipelineContext {
        PipelineContext::new(&Default::default(), CancellationToken::new())
    }

    #[test]
    fn test_one_pipeline_per_table_plus_janitor() {
        let pipelines = MirrorPipeline::from_config(&config(true), context());
        let keys: Vec<_> = pipelines.iter().map(|p| p.key().id().to_string()).collect();
        assert_eq!(keys, vec!["customers", "orders", JANITOR_KEY]);
    }

    #[test]
    fn test_janitor_disabled() {
        let pipelines = MirrorPipeline::from_config(&config(false), context());
        assert_eq!(pipelines.len(), 2);
        assert!(pipelines.iter().all(|p| matches!(p, MirrorPipeline::Table { .. })));
    }

    #[test]
    fn test_mirrored_tables() {
        let tables = MirrorPipeline::mirrored_tables(&config(true)).unwrap();
        assert_eq!(tables[0].to_string(), "Sales.customers");
        assert_eq!(tables[1].to_string(), "Sales.sales.Orders");
        assert_eq!(
            tables[1].landing_path().as_ref(),
            "Files/LandingZone/sales.schema/Orders"
        );
    }

    #[test]
    fn test_csv_source_from_config() {
        let config = config(true);
        let (key, table) = config.tables().nth(1).unwrap();
        let source = source_from_config(key, table).unwrap();
        assert_eq!(source.kind(), "csv_diff");
    }
}
