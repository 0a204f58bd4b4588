//! Removal of consumer control folders.
//!
//! The mirroring consumer moves applied files into `_ProcessedFiles` and
//! `_FilesReadyToDelete`; nothing else ever empties them. The janitor
//! deletes everything under those two folders, then the folder entry itself
//! where the store keeps one, and never touches anything else in a table
//! folder.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use floe_core::{IterationResult, PollingProcessor, StorageError};

use crate::emit;
use crate::error::{DeleteControlSnafu, JanitorError, ListControlSnafu, MirrorError};
use crate::landing::{CONTROL_FOLDERS, LandingZone, MirroredTable};
use crate::metrics::events::ControlFolderObjectsRemoved;

const MAX_CONCURRENT_DELETES: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub folders: usize,
    pub objects: usize,
}

#[derive(Debug, Clone)]
pub struct JanitorCleaner {
    landing: LandingZone,
}

impl JanitorCleaner {
    pub fn new(landing: LandingZone) -> Self {
        Self { landing }
    }

    /// Delete the control folders of `table`.
    ///
    /// A single listing of the table folder decides which control folders
    /// exist; absent folders cost nothing further.
    pub async fn clean(&self, table: &MirroredTable) -> Result<CleanReport, JanitorError> {
        let folder = table.landing_path();
        let storage = self.landing.storage();
        let listing = storage
            .list_directory(&folder)
            .await
            .context(ListControlSnafu {
                path: folder.to_string(),
            })?;

        let mut report = CleanReport::default();
        for name in CONTROL_FOLDERS {
            let control = folder.child(name);
            if !listing.folders.contains(&control) {
                continue;
            }

            let removed = self.remove_folder(&control).await?;
            report.folders += 1;
            report.objects += removed;
            info!(target = %table, folder = name, removed, "Removed control folder");
            emit!(ControlFolderObjectsRemoved {
                table: table.to_string(),
                folder: name,
                count: removed,
            });
        }

        if report.folders == 0 {
            debug!(target = %table, "No control folders present");
        }
        Ok(report)
    }

    async fn remove_folder(&self, control: &Path) -> Result<usize, JanitorError> {
        let storage = self.landing.storage();
        let objects: Vec<Path> = storage
            .list_with_prefix(control)
            .await
            .context(ListControlSnafu {
                path: control.to_string(),
            })?
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .map_err(|source| StorageError::ObjectStore { source })
            .context(ListControlSnafu {
                path: control.to_string(),
            })?;

        let removed: Vec<bool> = futures::stream::iter(objects)
            .map(|path| async move {
                storage
                    .delete_if_exists(&path)
                    .await
                    .context(DeleteControlSnafu {
                        path: path.to_string(),
                    })
            })
            .buffer_unordered(MAX_CONCURRENT_DELETES)
            .try_collect()
            .await?;

        // Hierarchical namespaces keep the emptied directory as an entry of
        // its own. Flat stores have no such entry and answer "not found".
        match storage.delete_if_exists(control).await {
            Ok(true) => debug!(folder = %control, "Removed empty control directory"),
            Ok(false) => {}
            Err(e) => debug!(folder = %control, error = %e, "Control directory left in place"),
        }

        Ok(removed.into_iter().filter(|r| *r).count())
    }
}

/// Periodic janitor pass over every configured table.
pub struct JanitorProcessor {
    cleaner: JanitorCleaner,
    tables: Vec<MirroredTable>,
}

impl JanitorProcessor {
    pub fn new(cleaner: JanitorCleaner, tables: Vec<MirroredTable>) -> Self {
        Self { cleaner, tables }
    }
}

#[async_trait]
impl PollingProcessor for JanitorProcessor {
    type State = ();
    type Error = MirrorError;

    async fn prepare(&mut self, _cold_start: bool) -> Result<Option<()>, MirrorError> {
        Ok((!self.tables.is_empty()).then_some(()))
    }

    /// Every table is attempted; the first failure is reported afterwards.
    async fn process(&mut self, _state: ()) -> Result<IterationResult, MirrorError> {
        let mut first_error = None;
        let mut objects = 0;

        for table in &self.tables {
            match self.cleaner.clean(table).await {
                Ok(report) => objects += report.objects,
                Err(e) => {
                    warn!(target = %table, error = %e, "Janitor failed for table");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e.into());
        }
        Ok(if objects > 0 {
            IterationResult::ProcessedItems
        } else {
            IterationResult::NoItems
        })
    }
}
