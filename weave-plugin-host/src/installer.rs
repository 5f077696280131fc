//! Plugin installation
//!
//! `install` copies a verified package into `<plugins_dir>/<id>/`, loads it
//! through the registry and records the version. If the new version fails to
//! load, the previous files are put back.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use walkdir::WalkDir;
use weave_plugin_api::{
    check_compatibility, check_manifest_upgrade, check_upgrade_compatibility, compare_versions,
    ManifestError, PluginManifest, Severity,
};

use crate::history::{HistoryError, InstallSource, VersionHistory, VersionRecord};
use crate::loader::InstalledPlugin;
use crate::registry::{PluginRegistry, RegistryError};
use crate::signature::{
    parse_signature_file, PluginPackage, SignatureFileError, SignatureVerificationResult,
    MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME,
};

const HISTORY_FILE_NAME: &str = "history.json";

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    SignatureFile(#[from] SignatureFileError),

    #[error("Signature verification failed for '{plugin_id}'")]
    Signature {
        plugin_id: String,
        result: SignatureVerificationResult,
    },

    #[error("Plugin '{0}' is not signed")]
    Unsigned(String),

    #[error("Plugin '{plugin_id}' is not compatible: {}", .issues.join("; "))]
    Incompatible { plugin_id: String, issues: Vec<String> },

    #[error("Plugin '{plugin_id}' {installed} is already installed (use force to replace)")]
    AlreadyInstalled { plugin_id: String, installed: String },

    #[error("Plugin '{0}' is not installed")]
    NotInstalled(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOptions {
    /// Replace an installed version that is the same or newer
    pub force: bool,
    /// Skip install-time signature checks; loading still applies the host's
    /// signature policy
    pub skip_signature: bool,
    pub source: InstallSource,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            force: false,
            skip_signature: false,
            source: InstallSource::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub plugin_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallResult {
    pub plugin_id: String,
    pub version: String,
    pub path: PathBuf,
}

/// Latest published versions, keyed by plugin id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryIndex {
    pub plugins: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub latest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

impl RegistryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, plugin_id: impl Into<String>, latest: impl Into<String>) -> Self {
        self.plugins.insert(
            plugin_id.into(),
            IndexEntry {
                latest: latest.into(),
                changelog: None,
            },
        );
        self
    }

    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn latest(&self, plugin_id: &str) -> Option<&str> {
        self.plugins.get(plugin_id).map(|e| e.latest.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub plugin_id: String,
    pub current: String,
    pub latest: String,
    /// Major version bump
    pub breaking: bool,
}

/// Plugins with a newer version in `index`
pub fn check_for_updates(installed: &[InstalledPlugin], index: &RegistryIndex) -> Vec<UpdateInfo> {
    installed
        .iter()
        .filter_map(|plugin| {
            let current = &plugin.manifest.version;
            let latest = index.latest(&plugin.manifest.id)?;
            if !matches!(compare_versions(latest, current), Ok(Ordering::Greater)) {
                return None;
            }
            Some(UpdateInfo {
                plugin_id: plugin.manifest.id.clone(),
                current: current.clone(),
                latest: latest.to_string(),
                breaking: check_upgrade_compatibility(current, latest).has_breaking_change(),
            })
        })
        .collect()
}

/// Installs packages into the registry's plugins directory
pub struct PluginInstaller {
    registry: PluginRegistry,
    plugins_dir: PathBuf,
    history: Mutex<VersionHistory>,
}

impl PluginInstaller {
    /// Version history persists in `<plugins_dir>/history.json`
    pub fn new(registry: PluginRegistry) -> Result<Self, InstallerError> {
        let plugins_dir = registry.loader().config().plugins_dir.clone();
        let history = VersionHistory::load(plugins_dir.join(HISTORY_FILE_NAME))?;
        Ok(Self {
            registry,
            plugins_dir,
            history: Mutex::new(history),
        })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn install_path(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(plugin_id)
    }

    pub fn history(&self, plugin_id: &str) -> Vec<VersionRecord> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).history(plugin_id)
    }

    pub fn previous_version(&self, plugin_id: &str) -> Option<String> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.previous_version(plugin_id).map(str::to_string)
    }

    pub fn can_rollback(&self, plugin_id: &str) -> bool {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).can_rollback(plugin_id)
    }

    pub async fn install(
        &self,
        source_dir: impl AsRef<Path>,
        options: InstallOptions,
    ) -> Result<InstallResult, InstallerError> {
        let source_dir = source_dir.as_ref();
        let auditor = self.registry.loader().auditor();

        match self.install_inner(source_dir, options).await {
            Ok(result) => {
                auditor.lifecycle(&result.plugin_id, "install", true);
                tracing::info!(
                    plugin = %result.plugin_id,
                    version = %result.version,
                    warnings = result.warnings.len(),
                    "Plugin installed"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(source = %source_dir.display(), error = %e, "Install failed");
                Err(e)
            }
        }
    }

    async fn install_inner(&self, source_dir: &Path, options: InstallOptions) -> Result<InstallResult, InstallerError> {
        let mut warnings = Vec::new();

        // Validate
        let raw = tokio::fs::read_to_string(source_dir.join(MANIFEST_FILE_NAME)).await?;
        let manifest = PluginManifest::from_json(&raw)?;
        let id = manifest.id.clone();

        // Verify
        if options.skip_signature {
            warnings.push("Signature verification skipped".to_string());
        } else {
            self.verify(source_dir, &manifest, &mut warnings).await?;
        }

        // Check compatibility
        let installed = self.registry.manifests().await;
        let current = installed.iter().find(|m| m.id == id).cloned();
        let others: Vec<PluginManifest> = installed.into_iter().filter(|m| m.id != id).collect();
        let app_version = &self.registry.loader().config().app_version;

        let result = check_compatibility(&manifest, app_version, &others);
        let errors: Vec<String> = result
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i| i.message.clone())
            .collect();
        if !errors.is_empty() {
            return Err(InstallerError::Incompatible { plugin_id: id, issues: errors });
        }
        warnings.extend(
            result
                .issues
                .iter()
                .filter(|i| i.severity == Severity::Warning)
                .map(|i| i.message.clone()),
        );

        if let Some(current) = &current {
            let newer = matches!(compare_versions(&manifest.version, &current.version), Ok(Ordering::Greater));
            if !newer && !options.force {
                return Err(InstallerError::AlreadyInstalled {
                    plugin_id: id,
                    installed: current.version.clone(),
                });
            }
            warnings.extend(check_manifest_upgrade(current, &manifest).issues.into_iter().map(|i| i.message));
        }

        // Copy
        let target = self.install_path(&id);
        let backup = self.plugins_dir.join(format!(".{}.backup", id));
        let copy_from = source_dir.to_path_buf();
        let (copy_target, copy_backup) = (target.clone(), backup.clone());
        tokio::task::spawn_blocking(move || stage(&copy_from, &copy_target, &copy_backup)).await??;

        // Load and register
        if let Err(e) = self.registry.load_plugin(&target).await {
            let (restore_target, restore_backup) = (target.clone(), backup.clone());
            tokio::task::spawn_blocking(move || restore(&restore_target, &restore_backup)).await??;
            return Err(e.into());
        }
        if backup.exists() {
            tokio::fs::remove_dir_all(&backup).await?;
        }

        // Record
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.record_install(&id, &manifest.version, options.source, None);
            history.save(self.plugins_dir.join(HISTORY_FILE_NAME))?;
        }

        Ok(InstallResult {
            plugin_id: id,
            version: manifest.version,
            previous_version: current.map(|m| m.version),
            warnings,
        })
    }

    async fn verify(
        &self,
        source_dir: &Path,
        manifest: &PluginManifest,
        warnings: &mut Vec<String>,
    ) -> Result<(), InstallerError> {
        let config = self.registry.loader().config();
        let content = match tokio::fs::read_to_string(source_dir.join(SIGNATURE_FILE_NAME)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if config.allow_unsigned {
                    warnings.push("Package is not signed".to_string());
                    return Ok(());
                }
                return Err(InstallerError::Unsigned(manifest.id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let signature = parse_signature_file(&content)?;
        let dir = source_dir.to_path_buf();
        let package = tokio::task::spawn_blocking(move || PluginPackage::from_dir(&dir)).await??;
        let result = self.registry.loader().verifier().verify(&package, &signature);

        warnings.extend(result.warnings.iter().map(|w| w.message.clone()));
        if !result.valid {
            return Err(InstallerError::Signature {
                plugin_id: manifest.id.clone(),
                result,
            });
        }
        Ok(())
    }

    pub async fn uninstall(&self, plugin_id: &str) -> Result<UninstallResult, InstallerError> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| InstallerError::NotInstalled(plugin_id.to_string()))?;
        let version = plugin.version().to_string();
        let path = plugin.path.clone();
        drop(plugin);

        self.registry.unregister(plugin_id).await?;
        if path.starts_with(&self.plugins_dir) && path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.record_uninstall(plugin_id, &version);
            history.save(self.plugins_dir.join(HISTORY_FILE_NAME))?;
        }
        // A later reinstall starts enabled
        if let Err(e) = self.registry.loader().disabled().remove(plugin_id) {
            tracing::warn!(plugin = %plugin_id, error = %e, "Failed to clear disabled flag");
        }

        self.registry.loader().auditor().lifecycle(plugin_id, "uninstall", true);
        tracing::info!(plugin = %plugin_id, version = %version, "Plugin uninstalled");
        Ok(UninstallResult {
            plugin_id: plugin_id.to_string(),
            version,
            path,
        })
    }

    /// Registered plugins with a newer version in `index`
    pub async fn check_for_updates(&self, index: &RegistryIndex) -> Vec<UpdateInfo> {
        check_for_updates(&self.registry.list().await, index)
    }
}

/// Move any existing install aside, then copy `source` into `target`
fn stage(source: &Path, target: &Path, backup: &Path) -> std::io::Result<()> {
    if backup.exists() {
        std::fs::remove_dir_all(backup)?;
    }
    if target.exists() {
        std::fs::rename(target, backup)?;
    }
    if let Err(e) = copy_dir(source, target) {
        restore(target, backup)?;
        return Err(e);
    }
    Ok(())
}

fn restore(target: &Path, backup: &Path) -> std::io::Result<()> {
    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    if backup.exists() {
        std::fs::rename(backup, target)?;
    }
    Ok(())
}

fn copy_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry.path().strip_prefix(source).map_err(std::io::Error::other)?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}
