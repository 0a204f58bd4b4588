//! Multi-file configuration loading.

use std::path::Path;

use indexmap::IndexMap;

use crate::config::{ConfigPath, GlobalConfig, MetricsConfig, interpolate, is_yaml_file};
use crate::error::ConfigError;

/// Trait for configs that can be merged from multiple files.
///
/// Components (tables) must be unique across files. `global` and `metrics`
/// merge last-non-default-wins; other singleton sections go through
/// [`Mergeable::merge_sections`].
pub trait Mergeable: Sized + Default {
    type Key: Eq + std::hash::Hash + Clone + std::fmt::Display;
    type Component;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component>;
    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component>;
    fn global(&self) -> &GlobalConfig;
    fn global_mut(&mut self) -> &mut GlobalConfig;
    fn metrics(&self) -> &MetricsConfig;
    fn metrics_mut(&mut self) -> &mut MetricsConfig;
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Merge config-specific singleton sections from `other`.
    fn merge_sections(&mut self, _other: &mut Self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn merge(&mut self, mut other: Self) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .components()
            .keys()
            .filter(|key| self.components().contains_key(*key))
            .map(|key| key.to_string())
            .collect();

        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateComponents { keys: duplicates });
        }

        self.merge_sections(&mut other)?;

        for (key, component) in other.components_mut().drain(..) {
            self.components_mut().insert(key, component);
        }

        self.global_mut()
            .merge_from(std::mem::take(other.global_mut()));
        self.metrics_mut()
            .merge_from(std::mem::take(other.metrics_mut()));
        Ok(())
    }
}

/// Load and merge every file and directory in `paths`, collecting all errors.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    for path in paths {
        let (display, partial) = match path {
            ConfigPath::File(file_path) => (file_path.display(), load_file::<C>(file_path)),
            ConfigPath::Dir(dir_path) => (dir_path.display(), load_dir::<C>(dir_path)),
        };
        match partial.and_then(|partial| config.merge(partial)) {
            Ok(()) => {}
            Err(e) => errors.push(format!("{display}: {e}")),
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let contents =
        std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile { source })?;

    let result = interpolate(&contents);
    if !result.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: result.errors.join("\n"),
        });
    }

    C::parse_yaml(&result.text)
}

fn load_dir<C: Mergeable>(dir: &Path) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();

    // Deterministic merge order
    files.sort();

    for path in files {
        match load_file::<C>(&path).and_then(|partial| config.merge(partial)) {
            Ok(()) => {}
            Err(e) => errors.push(format!("{}: {}", path.display(), e)),
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        tables: IndexMap<String, u32>,
        #[serde(default)]
        global: GlobalConfig,
        #[serde(default)]
        metrics: MetricsConfig,
    }

    impl Mergeable for TestConfig {
        type Key = String;
        type Component = u32;

        fn components(&self) -> &IndexMap<String, u32> {
            &self.tables
        }
        fn components_mut(&mut self) -> &mut IndexMap<String, u32> {
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
    }

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("config.yaml")));
        assert!(is_yaml_file(Path::new("config.yml")));
        assert!(!is_yaml_file(Path::new("config.toml")));
    }

    #[test]
    fn test_load_dir_merges_sorted_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "tables:\n  orders: 2\n").unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "tables:\n  customers: 1\nglobal:\n  total_concurrency: 3\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let config: TestConfig = load_from_paths(&[ConfigPath::dir(dir.path())]).unwrap();
        let keys: Vec<_> = config.tables.keys().cloned().collect();
        assert_eq!(keys, vec!["customers", "orders"]);
        assert_eq!(config.global.total_concurrency, Some(3));
    }

    #[test]
    fn test_duplicate_tables_across_files_rejected() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.yaml");
        let b = dir.path().join("b.yaml");
        std::fs::write(&a, "tables:\n  customers: 1\n").unwrap();
        std::fs::write(&b, "tables:\n  customers: 2\n").unwrap();

        let err = load_from_paths::<TestConfig>(&[ConfigPath::file(&a), ConfigPath::file(&b)])
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate component keys: customers"));
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let err = load_from_paths::<TestConfig>(&[ConfigPath::file(&path)]).unwrap_err();
        assert!(err.to_string().contains("only .yaml/.yml supported"));
    }
}
