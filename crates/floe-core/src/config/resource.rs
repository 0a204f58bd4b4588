//! Resource conflict detection.
//!
//! Two components in one process must never own the same landing-zone
//! folder or watermark file. Claims are checked once at config validation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// Something only one component may own.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Resource {
    /// A directory or object-store prefix (landing-zone table folder).
    Directory(String),
    /// A network port.
    Port(u16),
    /// A single file or object (watermark file).
    File(String),
}

impl Resource {
    /// Directory resource; trailing slashes are ignored.
    ///
    /// ```
    /// use floe_core::config::Resource;
    ///
    /// let a = Resource::directory("abfss://ws@onelake.dfs.fabric.microsoft.com/db/Files/LandingZone/Orders/");
    /// let b = Resource::directory("abfss://ws@onelake.dfs.fabric.microsoft.com/db/Files/LandingZone/Orders");
    /// assert_eq!(a, b);
    /// ```
    pub fn directory(path: &str) -> Self {
        Self::Directory(path.trim_end_matches('/').to_string())
    }

    pub fn port(port: u16) -> Self {
        Self::Port(port)
    }

    pub fn file(path: &str) -> Self {
        Self::File(path.trim_end_matches('/').to_string())
    }

    /// Resources claimed by more than one component, with their claimants.
    ///
    /// ```
    /// use floe_core::config::Resource;
    ///
    /// let claims = vec![
    ///     ("customers", vec![Resource::directory("/lz/Customers")]),
    ///     ("orders", vec![Resource::directory("/lz/Orders")]),
    ///     ("customers_copy", vec![Resource::directory("/lz/Customers/")]),
    /// ];
    ///
    /// let conflicts = Resource::conflicts(claims);
    /// let keys = &conflicts[&Resource::directory("/lz/Customers")];
    /// assert!(keys.contains("customers") && keys.contains("customers_copy"));
    /// ```
    pub fn conflicts<K>(
        components: impl IntoIterator<Item = (K, Vec<Resource>)>,
    ) -> HashMap<Resource, HashSet<K>>
    where
        K: Eq + Hash + Clone,
    {
        let mut claims: HashMap<Resource, HashSet<K>> = HashMap::new();

        for (key, resources) in components {
            for resource in resources {
                claims.entry(resource).or_default().insert(key.clone());
            }
        }

        claims.retain(|_, keys| keys.len() > 1);
        claims
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "directory:{path}"),
            Self::Port(port) => write!(f, "port:{port}"),
            Self::File(path) => write!(f, "file:{path}"),
        }
    }
}
