//! Hot reload file watcher for plugins
//!
//! Watches plugin root directories recursively. A change anywhere inside a
//! plugin directory reloads that plugin through the registry; losing the
//! directory's `manifest.json` unregisters it.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::discovery::{is_hidden, DiscoveryError, PluginScanner};
use crate::registry::{PluginRegistry, RegistryError};
use crate::signature::MANIFEST_FILE_NAME;

/// Configuration for the hot reload watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
    /// Whether to load existing plugins on start
    pub load_existing: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            load_existing: true,
        }
    }
}

/// Hot reload watcher for plugin directories
pub struct HotReloadWatcher {
    registry: PluginRegistry,
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl HotReloadWatcher {
    /// Create a new hot reload watcher for the given plugin roots
    pub async fn new(
        registry: PluginRegistry,
        roots: impl IntoIterator<Item = impl AsRef<Path>>,
        config: WatcherConfig,
    ) -> Result<Self, WatcherError> {
        let roots: Vec<PathBuf> = roots.into_iter().map(|p| p.as_ref().to_path_buf()).collect();

        if config.load_existing {
            let scanner = PluginScanner::new(registry.clone());
            for root in roots.iter().filter(|r| r.is_dir()) {
                let result = scanner.scan_directory(root).await?;
                for (path, e) in &result.failures {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to load plugin");
                }
            }
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.blocking_send(event);
            }
        })
        .map_err(WatcherError::WatcherInit)?;

        for root in &roots {
            if root.exists() {
                watcher
                    .watch(root, RecursiveMode::Recursive)
                    .map_err(WatcherError::WatcherInit)?;
                tracing::info!(dir = %root.display(), "Watching directory for plugins");
            } else {
                tracing::warn!(dir = %root.display(), "Directory does not exist, skipping");
            }
        }

        let registry_clone = registry.clone();
        let debounce = config.debounce;
        tokio::spawn(async move {
            let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
            let mut debounce_timer: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Hot reload watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        for path in event.paths {
                            if let Some(plugin_dir) = plugin_dir_for(&roots, &path) {
                                pending.insert(plugin_dir);
                                debounce_timer = Some(tokio::time::Instant::now() + debounce);
                            }
                        }
                    }

                    _ = async {
                        if let Some(deadline) = debounce_timer {
                            tokio::time::sleep_until(deadline).await;
                        } else {
                            std::future::pending::<()>().await;
                        }
                    } => {
                        for plugin_dir in std::mem::take(&mut pending) {
                            Self::handle_change(&registry_clone, &plugin_dir).await;
                        }
                        debounce_timer = None;
                    }
                }
            }
        });

        Ok(Self {
            registry,
            _watcher: watcher,
            shutdown_tx,
        })
    }

    async fn handle_change(registry: &PluginRegistry, plugin_dir: &Path) {
        if plugin_dir.join(MANIFEST_FILE_NAME).is_file() {
            match registry.reload_by_path(plugin_dir).await {
                Ok(_) => {}
                Err(RegistryError::Disabled(id)) => {
                    tracing::debug!(plugin = %id, path = %plugin_dir.display(), "Change ignored for disabled plugin");
                }
                Err(e) => tracing::warn!(path = %plugin_dir.display(), error = %e, "Failed to reload plugin"),
            }
        } else if let Some(id) = registry.unregister_by_path(plugin_dir).await {
            tracing::info!(plugin = %id, path = %plugin_dir.display(), "Plugin unloaded (manifest removed)");
        }
    }

    /// Get a reference to the plugin registry
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Shutdown the watcher
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// The plugin directory a changed path belongs to
fn plugin_dir_for(roots: &[PathBuf], path: &Path) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        let relative = path.strip_prefix(root).ok()?;
        match relative.components().next()? {
            Component::Normal(name) => {
                let dir = root.join(name);
                (!is_hidden(&dir)).then_some(dir)
            }
            _ => None,
        }
    })
}

/// Errors that can occur during watching
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}
