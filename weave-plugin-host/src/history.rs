//! Installed version history
//!
//! Each plugin keeps its last [`DEFAULT_MAX_HISTORY`] installs. An entry
//! without `uninstalled_at` is the live version; the most recently
//! uninstalled entry is the rollback target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_MAX_HISTORY: usize = 10;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to read history: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid history file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where a version came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallSource {
    Local,
    Marketplace,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version: String,
    pub installed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstalled_at: Option<DateTime<Utc>>,
    pub source: InstallSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

impl VersionRecord {
    pub fn is_current(&self) -> bool {
        self.uninstalled_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    #[serde(skip, default = "default_max")]
    max_entries: usize,
    plugins: BTreeMap<String, VecDeque<VersionRecord>>,
}

fn default_max() -> usize {
    DEFAULT_MAX_HISTORY
}

impl Default for VersionHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionHistory {
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            plugins: BTreeMap::new(),
        }
    }

    /// Record a new install; any live version of the plugin is closed first
    pub fn record_install(
        &mut self,
        plugin_id: &str,
        version: &str,
        source: InstallSource,
        changelog: Option<String>,
    ) {
        let now = Utc::now();
        let entries = self.plugins.entry(plugin_id.to_string()).or_default();
        for live in entries.iter_mut().filter(|r| r.is_current()) {
            live.uninstalled_at = Some(now);
        }

        entries.push_back(VersionRecord {
            version: version.to_string(),
            installed_at: now,
            uninstalled_at: None,
            source,
            changelog,
        });
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Mark the live `version` as uninstalled
    pub fn record_uninstall(&mut self, plugin_id: &str, version: &str) -> bool {
        let Some(entries) = self.plugins.get_mut(plugin_id) else {
            return false;
        };
        match entries.iter_mut().find(|r| r.version == version && r.is_current()) {
            Some(record) => {
                record.uninstalled_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Oldest first
    pub fn history(&self, plugin_id: &str) -> Vec<VersionRecord> {
        self.plugins
            .get(plugin_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn current_version(&self, plugin_id: &str) -> Option<&str> {
        self.plugins
            .get(plugin_id)?
            .iter()
            .rev()
            .find(|r| r.is_current())
            .map(|r| r.version.as_str())
    }

    /// Most recently uninstalled version
    pub fn previous_version(&self, plugin_id: &str) -> Option<&str> {
        let entries = self.plugins.get(plugin_id)?;
        if entries.len() < 2 {
            return None;
        }
        entries
            .iter()
            .filter(|r| !r.is_current())
            .max_by_key(|r| r.uninstalled_at)
            .map(|r| r.version.as_str())
    }

    pub fn can_rollback(&self, plugin_id: &str) -> bool {
        self.previous_version(plugin_id).is_some()
    }

    pub fn clear(&mut self, plugin_id: &str) {
        self.plugins.remove(plugin_id);
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_upgrade_rollback() {
        let mut history = VersionHistory::new();
        history.record_install("demo", "1.0.0", InstallSource::Local, None);
        assert_eq!(history.current_version("demo"), Some("1.0.0"));
        assert!(!history.can_rollback("demo"));

        history.record_install("demo", "1.1.0", InstallSource::Marketplace, Some("fixes".into()));
        assert_eq!(history.current_version("demo"), Some("1.1.0"));
        assert_eq!(history.previous_version("demo"), Some("1.0.0"));
        assert!(history.can_rollback("demo"));
    }

    #[test]
    fn test_keeps_last_ten() {
        let mut history = VersionHistory::new();
        for patch in 0..15 {
            history.record_install("demo", &format!("1.0.{}", patch), InstallSource::Local, None);
        }

        let records = history.history("demo");
        assert_eq!(records.len(), DEFAULT_MAX_HISTORY);
        assert_eq!(records[0].version, "1.0.5");
        assert_eq!(history.current_version("demo"), Some("1.0.14"));
    }

    #[test]
    fn test_uninstall() {
        let mut history = VersionHistory::new();
        history.record_install("demo", "1.0.0", InstallSource::Local, None);
        assert!(history.record_uninstall("demo", "1.0.0"));
        assert!(!history.record_uninstall("demo", "1.0.0"));
        assert_eq!(history.current_version("demo"), None);
        // A single entry is nothing to roll back to
        assert!(!history.can_rollback("demo"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut history = VersionHistory::new();
        history.record_install("demo", "1.0.0", InstallSource::Url, None);
        history.save(&path).unwrap();

        let loaded = VersionHistory::load(&path).unwrap();
        assert_eq!(loaded, history);
        assert!(VersionHistory::load(dir.path().join("missing.json")).unwrap().history("demo").is_empty());
    }
}
