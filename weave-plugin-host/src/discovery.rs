//! Plugin discovery and directory scanning
//!
//! A plugin is any direct subdirectory holding a `manifest.json`. Hidden
//! directories (the installer's backups among them) are skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::loader::LoadedPlugin;
use crate::registry::{PluginRegistry, RegistryError};
use crate::signature::MANIFEST_FILE_NAME;

/// Errors that can occur during plugin discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Failed to read directory: {0}")]
    ReadDirectory(#[source] std::io::Error),

    #[error("Failed to load plugin {path}: {source}")]
    LoadPlugin {
        path: PathBuf,
        #[source]
        source: RegistryError,
    },
}

/// Result of plugin discovery
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Successfully loaded plugins
    pub plugins: Vec<Arc<LoadedPlugin>>,

    /// Plugin directories that failed to load
    pub failures: Vec<(PathBuf, DiscoveryError)>,
}

impl DiscoveryResult {
    /// Returns true if all plugins loaded successfully
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of plugin directories found
    pub fn total_found(&self) -> usize {
        self.plugins.len() + self.failures.len()
    }
}

/// Plugin directories directly under `dir`, sorted
pub fn find_plugin_dirs(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !dir.is_dir() {
        return Err(DiscoveryError::DirectoryNotFound(dir.to_path_buf()));
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(DiscoveryError::ReadDirectory)? {
        let path = entry.map_err(DiscoveryError::ReadDirectory)?.path();
        if path.is_dir() && !is_hidden(&path) && path.join(MANIFEST_FILE_NAME).is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

pub(crate) fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Loads every plugin found in a directory into a registry
pub struct PluginScanner {
    registry: PluginRegistry,
}

impl PluginScanner {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    /// Scan a directory for plugin directories
    pub async fn scan_directory(&self, dir: impl AsRef<Path>) -> Result<DiscoveryResult, DiscoveryError> {
        let dir = dir.as_ref();
        let mut result = DiscoveryResult::default();

        for path in find_plugin_dirs(dir)? {
            match self.registry.load_plugin(&path).await {
                Ok(plugin) => result.plugins.push(plugin),
                Err(source) => result.failures.push((
                    path.clone(),
                    DiscoveryError::LoadPlugin { path, source },
                )),
            }
        }

        tracing::info!(
            dir = %dir.display(),
            loaded = result.plugins.len(),
            failed = result.failures.len(),
            "Plugin directory scanned"
        );
        Ok(result)
    }

    /// Scan multiple directories
    pub async fn scan_directories(&self, dirs: impl IntoIterator<Item = impl AsRef<Path>>) -> DiscoveryResult {
        let mut all = DiscoveryResult::default();

        for dir in dirs {
            match self.scan_directory(dir.as_ref()).await {
                Ok(result) => {
                    all.plugins.extend(result.plugins);
                    all.failures.extend(result.failures);
                }
                Err(e) => all.failures.push((dir.as_ref().to_path_buf(), e)),
            }
        }

        all
    }
}

/// Get default plugin directories for the current platform
pub fn default_plugin_dirs(app_name: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        dirs.push(config_dir.join(app_name).join("plugins"));
    }

    // Project-local plugins
    dirs.push(PathBuf::from("plugins"));

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleResolver;
    use crate::presets::HostPresets;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn scanner() -> PluginScanner {
        let config = HostPresets::testing().build().unwrap();
        PluginScanner::new(PluginRegistry::new(config, ModuleResolver::new()))
    }

    fn write_manifest(dir: &Path, id: &str) {
        fs::create_dir_all(dir).unwrap();
        let manifest = json!({ "id": id, "name": id, "version": "1.0.0", "category": "custom" });
        fs::write(dir.join(MANIFEST_FILE_NAME), manifest.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_scan_empty_directory() {
        let temp = TempDir::new().unwrap();
        let result = scanner().scan_directory(temp.path()).await.unwrap();

        assert!(result.plugins.is_empty());
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_scan_nonexistent_directory() {
        let result = scanner().scan_directory("/nonexistent/path/to/plugins").await;
        assert!(matches!(result, Err(DiscoveryError::DirectoryNotFound(_))));
    }

    #[tokio::test]
    async fn test_scan_mixed_directory() {
        let temp = TempDir::new().unwrap();
        write_manifest(&temp.path().join("good"), "good");
        write_manifest(&temp.path().join(".good.backup"), "good");
        fs::create_dir_all(temp.path().join("bad")).unwrap();
        fs::write(temp.path().join("bad").join(MANIFEST_FILE_NAME), "{}").unwrap();
        fs::create_dir_all(temp.path().join("assets")).unwrap();
        fs::write(temp.path().join("readme.txt"), "Hello").unwrap();

        let result = scanner().scan_directory(temp.path()).await.unwrap();

        assert_eq!(result.total_found(), 2);
        assert_eq!(result.plugins.len(), 1);
        assert_eq!(result.plugins[0].id(), "good");
        assert!(!result.is_success());
        assert!(result.failures[0].0.ends_with("bad"));
    }

    #[test]
    fn test_default_plugin_dirs() {
        let dirs = default_plugin_dirs("weave");
        assert!(!dirs.is_empty());
        assert!(dirs.iter().all(|d| d.ends_with("plugins")));
    }
}
