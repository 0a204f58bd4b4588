//! Landing-zone layout shared by every writer component.
//!
//! ```text
//! {database}/Files/LandingZone/[{schema}.schema/]{table}/
//!     _metadata.json
//!     00000000000000000001.parquet
//!     00000000000000000002.parquet
//!     _ProcessedFiles/        (consumer-managed)
//!     _FilesReadyToDelete/    (consumer-managed)
//! ```

use std::sync::LazyLock;

use floe_core::{NamespaceKind, StorageProviderRef};
use object_store::path::Path;
use regex::Regex;

pub const METADATA_FILE: &str = "_metadata.json";
pub const PROCESSED_FILES: &str = "_ProcessedFiles";
pub const FILES_READY_TO_DELETE: &str = "_FilesReadyToDelete";

/// The only control folders the janitor may remove.
pub const CONTROL_FOLDERS: [&str; 2] = [PROCESSED_FILES, FILES_READY_TO_DELETE];

const LANDING_ZONE_ROOT: &str = "Files/LandingZone";
const TEMP_SUFFIX: &str = ".temp";

static DATA_FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.parquet$").expect("Invalid regex pattern"));

/// Destination table in a mirrored database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirroredTable {
    workspace: String,
    database: String,
    schema: Option<String>,
    table: String,
}

impl MirroredTable {
    pub fn new(
        workspace: impl Into<String>,
        database: impl Into<String>,
        schema: Option<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            database: database.into(),
            schema: schema.filter(|s| !s.is_empty()),
            table: table.into(),
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table folder relative to the mirrored database root.
    ///
    /// ```
    /// use floe::landing::MirroredTable;
    ///
    /// let t = MirroredTable::new("ws", "Sales", Some("dbo".into()), "Customers");
    /// assert_eq!(t.landing_path().as_ref(), "Files/LandingZone/dbo.schema/Customers");
    /// ```
    pub fn landing_path(&self) -> Path {
        match &self.schema {
            Some(schema) => Path::from(format!(
                "{LANDING_ZONE_ROOT}/{schema}.schema/{}",
                self.table
            )),
            None => Path::from(format!("{LANDING_ZONE_ROOT}/{}", self.table)),
        }
    }

    /// Full path including the database, `{database}/Files/LandingZone/...`.
    pub fn storage_path(&self) -> String {
        format!("{}/{}/", self.database, self.landing_path())
    }

    pub fn file_path(&self, name: &str) -> Path {
        self.landing_path().child(name)
    }

    pub fn metadata_path(&self) -> Path {
        self.file_path(METADATA_FILE)
    }
}

impl std::fmt::Display for MirroredTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{schema}.{}", self.database, self.table),
            None => write!(f, "{}.{}", self.database, self.table),
        }
    }
}

/// The landing-zone store plus how it can make a file appear atomically.
#[derive(Debug, Clone)]
pub struct LandingZone {
    storage: StorageProviderRef,
    namespace: NamespaceKind,
}

impl LandingZone {
    /// `namespace` overrides what the store URL implies.
    pub fn new(storage: StorageProviderRef, namespace: Option<NamespaceKind>) -> Self {
        let namespace = namespace.unwrap_or_else(|| storage.config().namespace());
        Self { storage, namespace }
    }

    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    pub fn namespace(&self) -> NamespaceKind {
        self.namespace
    }
}

/// `{sequence:020}.parquet`.
pub fn data_file_name(sequence: u64) -> String {
    format!("{sequence:020}.parquet")
}

/// Sequence number of a data file name, `None` for anything else.
pub fn parse_data_file_name(name: &str) -> Option<u64> {
    DATA_FILE_PATTERN
        .captures(name)
        .and_then(|caps| caps[1].parse().ok())
}

/// `_{file}.temp`, invisible to the consumer's data-file pattern.
pub fn temp_name(file_name: &str) -> String {
    format!("_{file_name}{TEMP_SUFFIX}")
}

pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('_') && name.ends_with(TEMP_SUFFIX)
}
