//! Generic component identifier.
//!
//! Specialized as `TableKey` in floe, one per mirrored table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a component running in the topology.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Key for a schema-qualified table, `schema.table` or just `table`.
    ///
    /// ```
    /// use floe_core::config::ComponentKey;
    ///
    /// assert_eq!(ComponentKey::for_table(Some("sales"), "Orders").id(), "sales.Orders");
    /// assert_eq!(ComponentKey::for_table(None, "Customers").id(), "Customers");
    /// assert_eq!(ComponentKey::for_table(Some(""), "Customers").id(), "Customers");
    /// ```
    pub fn for_table(schema: Option<&str>, table: &str) -> Self {
        match schema.filter(|s| !s.is_empty()) {
            Some(schema) => Self(format!("{schema}.{table}")),
            None => Self(table.to_string()),
        }
    }

    /// Key safe to use as a single file-name segment.
    ///
    /// Path separators and anything outside `[A-Za-z0-9._-]` become `_`.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ComponentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
