//! Persistence for granted permissions
//!
//! A stored grant carries the hash of the permission set it covered, so a
//! plugin that asks for a different set on re-install is detected as an
//! escalation instead of silently inheriting the old approval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use weave_plugin_api::PermissionSet;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read grant store: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse grant store: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Grant store is read-only")]
    ReadOnly,
}

/// A remembered approval for one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGrant {
    pub granted_at: DateTime<Utc>,
    /// Hash of the permissions the manifest requested at grant time
    pub permissions_hash: String,
    /// What was actually granted
    pub permissions: PermissionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredGrant {
    pub fn new(requested: &PermissionSet, granted: PermissionSet) -> Self {
        Self {
            granted_at: Utc::now(),
            permissions_hash: requested.compute_hash(),
            permissions: granted,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// The manifest now requests a different permission set
    pub fn has_escalated(&self, requested: &PermissionSet) -> bool {
        self.permissions_hash != requested.compute_hash()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Where grants are remembered between loads
pub trait GrantStore: Send + Sync {
    fn get(&self, plugin_id: &str) -> Result<Option<StoredGrant>, StoreError>;

    fn set(&self, plugin_id: &str, grant: StoredGrant) -> Result<(), StoreError>;

    fn remove(&self, plugin_id: &str) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<(String, StoredGrant)>, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

// ============================================================================
// File-based Grant Store
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GrantFileData {
    version: u32,
    plugins: HashMap<String, StoredGrant>,
}

impl Default for GrantFileData {
    fn default() -> Self {
        Self {
            version: 1,
            plugins: HashMap::new(),
        }
    }
}

/// JSON file store, by default at `~/.config/<app>/grants.json`
pub struct FileGrantStore {
    path: PathBuf,
    data: RwLock<GrantFileData>,
}

impl FileGrantStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            GrantFileData::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn default_for_app(app_name: &str) -> Result<Self, StoreError> {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        Self::new(config_dir.join(app_name).join("grants.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(writer, &*data)?;
        Ok(())
    }
}

impl GrantStore for FileGrantStore {
    fn get(&self, plugin_id: &str) -> Result<Option<StoredGrant>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.plugins.get(plugin_id).cloned())
    }

    fn set(&self, plugin_id: &str, grant: StoredGrant) -> Result<(), StoreError> {
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.plugins.insert(plugin_id.to_string(), grant);
        }
        self.save()
    }

    fn remove(&self, plugin_id: &str) -> Result<(), StoreError> {
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.plugins.remove(plugin_id);
        }
        self.save()
    }

    fn list(&self) -> Result<Vec<(String, StoredGrant)>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data
            .plugins
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> Result<(), StoreError> {
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.plugins.clear();
        }
        self.save()
    }
}

impl std::fmt::Debug for FileGrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGrantStore")
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// In-Memory Grant Store
// ============================================================================

/// Session-only grants, also used in tests
#[derive(Default)]
pub struct MemoryGrantStore {
    data: RwLock<HashMap<String, StoredGrant>>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GrantStore for MemoryGrantStore {
    fn get(&self, plugin_id: &str) -> Result<Option<StoredGrant>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(plugin_id).cloned())
    }

    fn set(&self, plugin_id: &str, grant: StoredGrant) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(plugin_id.to_string(), grant);
        Ok(())
    }

    fn remove(&self, plugin_id: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.remove(plugin_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, StoredGrant)>, StoreError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.data.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

impl std::fmt::Debug for MemoryGrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGrantStore")
            .field("count", &self.len())
            .finish()
    }
}

// ============================================================================
// Read-Only Grant Store
// ============================================================================

/// Pre-provisioned grants that cannot change at runtime (CI)
pub struct ReadOnlyGrantStore<S: GrantStore> {
    inner: S,
}

impl<S: GrantStore> ReadOnlyGrantStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: GrantStore> GrantStore for ReadOnlyGrantStore<S> {
    fn get(&self, plugin_id: &str) -> Result<Option<StoredGrant>, StoreError> {
        self.inner.get(plugin_id)
    }

    fn set(&self, _plugin_id: &str, _grant: StoredGrant) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn remove(&self, _plugin_id: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn list(&self) -> Result<Vec<(String, StoredGrant)>, StoreError> {
        self.inner.list()
    }

    fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}

impl<S: GrantStore + std::fmt::Debug> std::fmt::Debug for ReadOnlyGrantStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyGrantStore")
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use weave_plugin_api::PluginPermission;

    fn requested() -> PermissionSet {
        [PluginPermission::Storage, PluginPermission::Network]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryGrantStore::new();
        let grant = StoredGrant::new(&requested(), [PluginPermission::Storage].into_iter().collect());

        store.set("demo", grant.clone()).unwrap();
        assert_eq!(store.get("demo").unwrap(), Some(grant));
        assert_eq!(store.len(), 1);

        store.remove("demo").unwrap();
        assert!(store.get("demo").unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grants.json");

        let store = FileGrantStore::new(&path).unwrap();
        store
            .set("demo", StoredGrant::new(&requested(), requested()))
            .unwrap();
        assert!(path.exists());

        let reopened = FileGrantStore::new(&path).unwrap();
        let grant = reopened.get("demo").unwrap().unwrap();
        assert!(grant.permissions.contains(PluginPermission::Network));
        assert_eq!(reopened.list().unwrap().len(), 1);
    }

    #[test]
    fn test_escalation_detection() {
        let grant = StoredGrant::new(&requested(), requested());
        assert!(!grant.has_escalated(&requested()));

        let mut more = requested();
        more.insert(PluginPermission::Secrets);
        assert!(grant.has_escalated(&more));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let grant = StoredGrant::new(&requested(), requested());
        assert!(!grant.is_expired(now));

        let grant = grant.with_expiry(now - Duration::seconds(1));
        assert!(grant.is_expired(now));
    }

    #[test]
    fn test_read_only_store() {
        let inner = MemoryGrantStore::new();
        inner
            .set("demo", StoredGrant::new(&requested(), requested()))
            .unwrap();

        let store = ReadOnlyGrantStore::new(inner);
        assert!(store.get("demo").unwrap().is_some());
        assert!(matches!(store.remove("demo"), Err(StoreError::ReadOnly)));
        assert!(matches!(store.clear(), Err(StoreError::ReadOnly)));
    }
}
