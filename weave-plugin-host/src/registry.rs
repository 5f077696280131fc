//! Plugin registry with hot reload support
//!
//! Provides a thread-safe registry of loaded plugins. Entries are
//! `Arc<LoadedPlugin>` handles tagged with a generation number: a reload
//! builds a new handle and swaps it in, so callers holding the old handle
//! finish their work against it undisturbed.
//!
//! The write lock only ever guards map edits. Deactivation, module hooks and
//! loading all run after the lock is released.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use weave_plugin_api::PluginManifest;
use weave_plugin_sdk::NodeDefinition;

use crate::disabled::DisabledError;
use crate::loader::{InstalledPlugin, LoadedPlugin, LoaderError, PluginLoader};
use crate::module::ModuleResolver;
use crate::presets::HostConfig;
use crate::sandbox::ResourceEvent;
use crate::state::{LifecycleEvent, PluginState, StateError};

/// A thread-safe registry for managing loaded plugins
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    loader: Arc<PluginLoader>,
}

#[derive(Default)]
struct RegistryInner {
    /// Plugins indexed by id
    plugins: HashMap<String, PluginEntry>,
    /// Plugin directory to id, for watcher driven reloads
    path_to_id: HashMap<PathBuf, String>,
    /// Last failed load per plugin id (or path, when the id is unknown)
    failed: HashMap<String, FailedLoad>,
    next_generation: u64,
}

struct PluginEntry {
    plugin: Arc<LoadedPlugin>,
    generation: u64,
}

impl RegistryInner {
    /// Insert `plugin`, returning the handle it replaced
    fn insert(&mut self, plugin: Arc<LoadedPlugin>) -> Option<Arc<LoadedPlugin>> {
        self.next_generation += 1;
        let id = plugin.id().to_string();
        self.failed.remove(&id);
        self.failed.remove(&plugin.path.display().to_string());
        self.path_to_id.insert(plugin.path.clone(), id.clone());

        let old = self.plugins.insert(
            id,
            PluginEntry {
                plugin,
                generation: self.next_generation,
            },
        )?;
        if !self.plugins.values().any(|e| e.plugin.path == old.plugin.path) {
            self.path_to_id.remove(&old.plugin.path);
        }
        Some(old.plugin)
    }

    fn remove(&mut self, id: &str) -> Option<Arc<LoadedPlugin>> {
        let entry = self.plugins.remove(id)?;
        self.path_to_id.remove(&entry.plugin.path);
        Some(entry.plugin)
    }
}

/// A load that did not produce a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedLoad {
    pub path: PathBuf,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Errors that can occur during registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin '{0}' is disabled; enable it first")]
    Disabled(String),

    #[error(transparent)]
    Persist(#[from] DisabledError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new(config: HostConfig, resolver: ModuleResolver) -> Self {
        Self::with_loader(PluginLoader::new(config, resolver))
    }

    /// Create with an existing loader
    pub fn with_loader(loader: PluginLoader) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            loader: Arc::new(loader),
        }
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Load and register the plugin in `path`
    ///
    /// A plugin already registered under the same id is replaced and then
    /// deactivated.
    pub async fn load_plugin(&self, path: impl AsRef<Path>) -> Result<Arc<LoadedPlugin>, RegistryError> {
        let path = path.as_ref();
        let plugin = match self.loader.load(path).await {
            Ok(plugin) => Arc::new(plugin),
            Err(e) => {
                self.record_failure(path, &e).await;
                return Err(e.into());
            }
        };

        let replaced = self.inner.write().await.insert(plugin.clone());
        if let Some(old) = replaced {
            self.retire(&old).await;
        }

        tracing::info!(plugin = %plugin.id(), path = %path.display(), "Plugin loaded");
        self.enforce_limits(plugin.id()).await;
        Ok(plugin)
    }

    /// Register a pre-loaded plugin
    pub async fn register(&self, plugin: LoadedPlugin) -> Arc<LoadedPlugin> {
        let plugin = Arc::new(plugin);
        let replaced = self.inner.write().await.insert(plugin.clone());
        if let Some(old) = replaced {
            self.retire(&old).await;
        }

        tracing::info!(plugin = %plugin.id(), "Plugin registered");
        plugin
    }

    pub async fn get(&self, id: &str) -> Option<Arc<LoadedPlugin>> {
        let inner = self.inner.read().await;
        inner.plugins.get(id).map(|e| e.plugin.clone())
    }

    /// Generation of the current handle; bumps on every reload
    pub async fn generation(&self, id: &str) -> Option<u64> {
        let inner = self.inner.read().await;
        inner.plugins.get(id).map(|e| e.generation)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.plugins.contains_key(id)
    }

    /// Remove a plugin and deactivate it
    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let plugin = self
            .inner
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        self.retire(&plugin).await;
        self.loader.monitor().clear(id);
        self.loader.auditor().lifecycle(id, "unregister", true);
        tracing::info!(plugin = %id, "Plugin unregistered");
        Ok(())
    }

    /// Unregister whatever plugin was loaded from `path`
    pub async fn unregister_by_path(&self, path: impl AsRef<Path>) -> Option<String> {
        let id = self.inner.read().await.path_to_id.get(path.as_ref()).cloned()?;
        self.unregister(&id).await.ok()?;
        Some(id)
    }

    /// Handles of every active plugin
    pub async fn list_active(&self) -> Vec<Arc<LoadedPlugin>> {
        let inner = self.inner.read().await;
        let mut active: Vec<_> = inner
            .plugins
            .values()
            .filter(|e| e.plugin.state().is_active())
            .map(|e| e.plugin.clone())
            .collect();
        active.sort_by(|a, b| a.id().cmp(b.id()));
        active
    }

    /// Snapshot of every registered plugin, sorted by id
    pub async fn list(&self) -> Vec<InstalledPlugin> {
        let inner = self.inner.read().await;
        let mut all: Vec<_> = inner.plugins.values().map(|e| e.plugin.info()).collect();
        all.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        all
    }

    pub async fn manifests(&self) -> Vec<PluginManifest> {
        let inner = self.inner.read().await;
        inner
            .plugins
            .values()
            .map(|e| (*e.plugin.manifest).clone())
            .collect()
    }

    /// Current state; failed loads report `Error`
    pub async fn state_of(&self, id: &str) -> Option<PluginState> {
        let inner = self.inner.read().await;
        match inner.plugins.get(id) {
            Some(entry) => Some(entry.plugin.state()),
            None if inner.failed.contains_key(id) => Some(PluginState::Error),
            None => None,
        }
    }

    pub async fn failure(&self, id: &str) -> Option<FailedLoad> {
        self.inner.read().await.failed.get(id).cloned()
    }

    /// Deactivate a plugin and keep it registered as `Disabled`
    ///
    /// The plugin stays disabled across restarts until [`enable`](Self::enable).
    pub async fn disable(&self, id: &str) -> Result<(), RegistryError> {
        let plugin = self.get(id).await.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if plugin.state() != PluginState::Disabled {
            if plugin.state().is_active() {
                plugin.shutdown(self.loader.auditor()).await?;
            }
            plugin.transition(LifecycleEvent::Disable)?;
            self.loader.auditor().lifecycle(id, "disable", true);
            tracing::info!(plugin = %id, "Plugin disabled");
        }

        if self.loader.disabled().insert(id)? {
            tracing::debug!(plugin = %id, path = %self.loader.disabled().path().display(), "Disable persisted");
        }
        Ok(())
    }

    /// Re-enable a disabled plugin by loading it again
    pub async fn enable(&self, id: &str) -> Result<Arc<LoadedPlugin>, RegistryError> {
        let plugin = self.get(id).await.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        plugin.transition(LifecycleEvent::Enable)?;
        if let Err(e) = self.loader.disabled().remove(id) {
            plugin.transition(LifecycleEvent::Disable)?;
            return Err(e.into());
        }
        self.loader.monitor().clear(id);

        self.loader.auditor().lifecycle(id, "enable", true);
        tracing::info!(plugin = %id, "Plugin enabled");
        self.reload(id).await
    }

    /// Load a fresh handle from the plugin's directory and swap it in
    ///
    /// On failure the current handle stays registered untouched. A disabled
    /// plugin is refused; only [`enable`](Self::enable) brings it back.
    pub async fn reload(&self, id: &str) -> Result<Arc<LoadedPlugin>, RegistryError> {
        let path = {
            let inner = self.inner.read().await;
            match (inner.plugins.get(id), inner.failed.get(id)) {
                (Some(entry), _) if entry.plugin.state() == PluginState::Disabled => {
                    return Err(RegistryError::Disabled(id.to_string()));
                }
                (Some(entry), _) => entry.plugin.path.clone(),
                (None, Some(failed)) => failed.path.clone(),
                (None, None) => return Err(RegistryError::NotFound(id.to_string())),
            }
        };

        self.loader.monitor().clear(id);
        let fresh = match self.loader.load(&path).await {
            Ok(plugin) => Arc::new(plugin),
            Err(e) => {
                tracing::warn!(plugin = %id, error = %e, "Reload failed; keeping current version");
                if !self.contains(id).await {
                    self.record_failure(&path, &e).await;
                }
                return Err(e.into());
            }
        };

        let (replaced, generation) = {
            let mut inner = self.inner.write().await;
            let replaced = inner.insert(fresh.clone());
            (replaced, inner.next_generation)
        };
        if let Some(old) = replaced {
            self.retire(&old).await;
        }

        self.loader.auditor().lifecycle(id, "reload", true);
        tracing::info!(plugin = %id, version = %fresh.version(), generation, "Plugin reloaded");
        self.enforce_limits(id).await;
        Ok(fresh)
    }

    /// Reload the plugin in `path`, loading it if it is new
    pub async fn reload_by_path(&self, path: impl AsRef<Path>) -> Result<Arc<LoadedPlugin>, RegistryError> {
        let path = path.as_ref();
        let known = self.inner.read().await.path_to_id.get(path).cloned();
        match known {
            Some(id) => self.reload(&id).await,
            None => self.load_plugin(path).await,
        }
    }

    /// Deactivate and remove every plugin
    pub async fn deactivate_all(&self) -> usize {
        let drained: Vec<Arc<LoadedPlugin>> = {
            let mut inner = self.inner.write().await;
            inner.path_to_id.clear();
            inner.plugins.drain().map(|(_, e)| e.plugin).collect()
        };

        for plugin in &drained {
            self.retire(plugin).await;
        }
        self.loader.auditor().flush();
        tracing::info!(count = drained.len(), "All plugins deactivated");
        drained.len()
    }

    /// Find an executable node among active plugins
    pub async fn find_node(&self, node_id: &str) -> Option<(Arc<LoadedPlugin>, NodeDefinition)> {
        let inner = self.inner.read().await;
        inner
            .plugins
            .values()
            .filter(|e| e.plugin.state().is_active())
            .find_map(|e| {
                e.plugin
                    .nodes()
                    .iter()
                    .find(|n| n.id() == node_id)
                    .map(|n| (e.plugin.clone(), n.clone()))
            })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.plugins.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.plugins.is_empty()
    }

    /// Disable plugins the resource monitor flags
    ///
    /// Runs until the registry is dropped. Returns `None` when the loader's
    /// event channel was already taken.
    pub fn spawn_resource_listener(&self) -> Option<tokio::task::JoinHandle<()>> {
        let mut events = self.loader.take_resource_events()?;
        let inner: Weak<RwLock<RegistryInner>> = Arc::downgrade(&self.inner);
        let loader = self.loader.clone();

        Some(tokio::spawn(async move {
            while let Some(ResourceEvent::LimitExceeded { plugin_id, reason }) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let registry = PluginRegistry {
                    inner,
                    loader: loader.clone(),
                };

                tracing::warn!(plugin = %plugin_id, reason = %reason, "Disabling plugin over resource limits");
                if let Err(e) = registry.disable(&plugin_id).await {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Failed to disable plugin");
                }
            }
        }))
    }

    /// Breaches during activation happen before the plugin is registered
    async fn enforce_limits(&self, id: &str) {
        if !self.loader.monitor().is_flagged(id) {
            return;
        }
        if let Err(e) = self.disable(id).await {
            tracing::warn!(plugin = %id, error = %e, "Failed to disable plugin");
        }
    }

    /// Deactivate a handle that is no longer registered
    async fn retire(&self, plugin: &LoadedPlugin) {
        if !plugin.state().is_active() {
            return;
        }
        if let Err(e) = plugin.shutdown(self.loader.auditor()).await {
            tracing::warn!(plugin = %plugin.id(), error = %e, "Failed to deactivate plugin");
        }
    }

    async fn record_failure(&self, path: &Path, error: &LoaderError) {
        let key = error
            .plugin_id()
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        self.inner.write().await.failed.insert(
            key,
            FailedLoad {
                path: path.to_path_buf(),
                error: error.to_string(),
                failed_at: Utc::now(),
            },
        );
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}
