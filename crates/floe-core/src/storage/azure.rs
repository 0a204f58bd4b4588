//! Azure backend: ADLS Gen2 / Blob accounts and OneLake.

use object_store::azure::MicrosoftAzureBuilder;
use object_store::multipart::MultipartStore;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AzureConfigSnafu, StorageError};

use super::{BackendConfig, NamespaceKind, StorageProvider};

/// Azure storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub account: String,
    /// Container, or the workspace name on OneLake.
    pub container: String,
    pub key: Option<Path>,
    /// Route requests to `*.fabric.microsoft.com` instead of `*.core.windows.net`.
    pub fabric: bool,
    pub namespace: NamespaceKind,
}

impl StorageProvider {
    pub(super) async fn construct_azure(
        config: AzureConfig,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(&config.account)
            .with_container_name(&config.container);

        // Credentials (client id / secret / tenant, SAS, managed identity) arrive
        // through the environment or storage_options.
        for (key, value) in &options {
            builder = builder.with_config(key.parse().context(AzureConfigSnafu)?, value.clone());
        }

        builder = builder
            .with_use_fabric_endpoint(config.fabric)
            .with_retry(RetryConfig::default());

        let host = if config.fabric {
            "onelake.blob.fabric.microsoft.com".to_string()
        } else {
            format!("{}.blob.core.windows.net", config.account)
        };
        let canonical_url = match &config.key {
            Some(key) => format!("https://{host}/{}/{key}", config.container),
            None => format!("https://{host}/{}", config.container),
        };

        let azure_store = Arc::new(builder.build().context(AzureConfigSnafu)?);
        let multipart_store: Option<Arc<dyn MultipartStore>> = Some(azure_store.clone());
        let object_store: Arc<dyn ObjectStore> = azure_store;

        Ok(Self {
            config: BackendConfig::Azure(config),
            object_store,
            multipart_store,
            canonical_url,
            storage_options: options,
        })
    }
}
