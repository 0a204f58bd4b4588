//! Identifier for a mirrored table in the `tables:` section.

use floe_core::ComponentKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a mirrored table.
///
/// The key names the table's loop in logs and metrics and its watermark
/// document in the state store. It defaults the destination table name
/// when `table:` is not set.
///
/// # Examples
///
/// ```
/// use floe::config::TableKey;
///
/// let key = TableKey::new("customers");
/// assert_eq!(key.id(), "customers");
///
/// let key = TableKey::for_table(Some("dbo"), "Orders");
/// assert_eq!(key.id(), "dbo.Orders");
/// ```
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableKey(ComponentKey);

impl TableKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(ComponentKey::new(id))
    }

    pub fn id(&self) -> &str {
        self.0.id()
    }

    /// Key for a schema-qualified table, `schema.table` or just `table`.
    pub fn for_table(schema: Option<&str>, table: &str) -> Self {
        Self(ComponentKey::for_table(schema, table))
    }

    /// Key safe to use as a file-name segment in the state store.
    pub fn file_stem(&self) -> String {
        self.0.file_stem()
    }

    pub fn component(&self) -> &ComponentKey {
        &self.0
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TableKey {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let key = TableKey::new("customers");
        assert_eq!(key.id(), "customers");
        assert_eq!(key.to_string(), "customers");
    }

    #[test]
    fn test_for_table() {
        assert_eq!(TableKey::for_table(Some("sales"), "Orders").id(), "sales.Orders");
        assert_eq!(TableKey::for_table(None, "Orders").id(), "Orders");
    }

    #[test]
    fn test_file_stem_replaces_separators() {
        let key = TableKey::new("sales/orders eu");
        assert_eq!(key.file_stem(), "sales_orders_eu");
    }

    #[test]
    fn test_serde_roundtrip() {
        let key = TableKey::new("customers");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"customers\"");

        let parsed: TableKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_hash_map_key() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(TableKey::new("customers"), 1);
        map.insert(TableKey::new("orders"), 2);

        assert_eq!(map.get(&TableKey::new("customers")), Some(&1));
        assert_eq!(map.get(&TableKey::new("orders")), Some(&2));
    }
}
