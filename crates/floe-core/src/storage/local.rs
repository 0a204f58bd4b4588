//! Local filesystem backend, used for tests and dry runs.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl StorageProvider {
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu)?;

        // Empty directories left behind by deletes would otherwise show up as
        // prefixes in delimiter listings.
        let store = LocalFileSystem::new_with_prefix(&config.path)
            .context(ObjectStoreSnafu)?
            .with_automatic_cleanup(true);
        let object_store: Arc<dyn ObjectStore> = Arc::new(store);

        let canonical_url = format!("file://{}", config.path);

        Ok(Self {
            config: BackendConfig::Local(config),
            object_store,
            multipart_store: None,
            canonical_url,
            storage_options: HashMap::new(),
        })
    }
}
