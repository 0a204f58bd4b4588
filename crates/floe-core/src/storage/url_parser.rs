//! URL parsing for storage backends.
//!
//! Recognizes OneLake (Fabric) endpoints, plain ADLS Gen2 / Blob URLs and
//! local filesystem paths.

use object_store::path::Path;
use regex::Regex;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{InvalidUrlSnafu, RegexGroupMissingSnafu, StorageError};

use super::{AzureConfig, LocalConfig, NamespaceKind};

const ONELAKE_ABFS: &str = r"^abfss?://(?P<container>[^@/]+)@onelake\.(?P<endpoint>dfs|blob)\.fabric\.microsoft\.com(/(?P<key>.+))?$";
const ONELAKE_HTTPS: &str = r"^https://onelake\.(?P<endpoint>dfs|blob)\.fabric\.microsoft\.com/(?P<container>[^/]+)(/(?P<key>.+))?$";

const ABFS_URL: &str = r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.(?P<endpoint>dfs)\.core\.windows\.net(/(?P<key>.+))?$";
const AZURE_HTTPS: &str = r"^https://(?P<account>[a-z0-9]+)\.(?P<endpoint>blob|dfs)\.core\.windows\.net/(?P<container>[a-z0-9\-]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Backend {
    OneLake,
    Azure,
    Local,
}

fn matchers() -> &'static HashMap<Backend, Vec<Regex>> {
    static MATCHERS: OnceLock<HashMap<Backend, Vec<Regex>>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
        };

        let mut m = HashMap::new();
        m.insert(Backend::OneLake, compile(&[ONELAKE_ABFS, ONELAKE_HTTPS]));
        m.insert(Backend::Azure, compile(&[ABFS_URL, AZURE_HTTPS]));
        m.insert(Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH]));
        m
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Azure(AzureConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (k, v) in matchers() {
            if let Some(matches) = v.iter().find_map(|r| r.captures(url)) {
                return match k {
                    Backend::OneLake => Self::parse_azure(&matches, true),
                    Backend::Azure => Self::parse_azure(&matches, false),
                    Backend::Local => Self::parse_local(&matches),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn group<'a>(matches: &'a regex::Captures, group: &str) -> Result<&'a str, StorageError> {
        matches
            .name(group)
            .map(|m| m.as_str())
            .context(RegexGroupMissingSnafu { group })
    }

    fn parse_azure(matches: &regex::Captures, fabric: bool) -> Result<Self, StorageError> {
        let container = Self::group(matches, "container")?.to_string();
        let account = if fabric {
            "onelake".to_string()
        } else {
            Self::group(matches, "account")?.to_string()
        };

        // abfs(s) always speaks the DFS protocol.
        let namespace = match Self::group(matches, "endpoint")? {
            "blob" => NamespaceKind::Flat,
            _ => NamespaceKind::Hierarchical,
        };

        let key = matches.name("key").map(|r| r.as_str().trim_end_matches('/').into());

        Ok(BackendConfig::Azure(AzureConfig {
            account,
            container,
            key,
            fabric,
            namespace,
        }))
    }

    fn parse_local(matches: &regex::Captures) -> Result<Self, StorageError> {
        let path = Self::group(matches, "path")?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let path = match path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };

        Ok(BackendConfig::Local(LocalConfig { path }))
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::Azure(azure) => azure.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }

    /// Namespace capability implied by the URL.
    ///
    /// Local filesystems rename natively, so they count as hierarchical.
    pub fn namespace(&self) -> NamespaceKind {
        match self {
            BackendConfig::Azure(azure) => azure.namespace,
            BackendConfig::Local(_) => NamespaceKind::Hierarchical,
        }
    }
}
