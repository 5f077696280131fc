//! Per-activation plugin context

use std::path::{Path, PathBuf};
use std::sync::Arc;
use weave_plugin_api::PluginManifest;

use crate::disposable::{Disposable, DisposableStore};

/// Handed to `activate` alongside the sandboxed API
///
/// A new context is created for every activation, so nothing registered by
/// a previous activation leaks into the next one.
#[derive(Debug, Clone)]
pub struct PluginContext {
    manifest: Arc<PluginManifest>,
    extension_path: PathBuf,
    subscriptions: DisposableStore,
}

impl PluginContext {
    pub fn new(manifest: Arc<PluginManifest>, extension_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            extension_path: extension_path.into(),
            subscriptions: DisposableStore::new(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.manifest.id
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Directory the plugin was loaded from
    pub fn extension_path(&self) -> &Path {
        &self.extension_path
    }

    /// Resolve a path relative to the plugin directory
    pub fn as_absolute_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.extension_path.join(relative)
    }

    /// Track a registration for disposal on deactivation
    pub fn subscribe(&self, disposable: Disposable) {
        self.subscriptions.push(disposable);
    }

    pub fn subscriptions(&self) -> &DisposableStore {
        &self.subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_tracks_subscriptions() {
        let manifest = PluginManifest::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "category": "custom",
        }))
        .unwrap();
        let ctx = PluginContext::new(Arc::new(manifest), "/plugins/demo");

        assert_eq!(ctx.plugin_id(), "demo");
        assert_eq!(ctx.version(), "1.0.0");
        assert_eq!(ctx.as_absolute_path("README.md"), PathBuf::from("/plugins/demo/README.md"));

        ctx.subscribe(Disposable::noop("a"));
        ctx.subscribe(Disposable::noop("b"));
        assert_eq!(ctx.subscriptions().len(), 2);
        assert!(ctx.subscriptions().dispose_all().is_empty());
        assert!(ctx.subscriptions().is_empty());
    }
}
