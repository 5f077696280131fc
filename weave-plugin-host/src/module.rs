//! Plugin module contract and entry point resolution
//!
//! A manifest's `main` names an entry point. The host maps entry points to
//! factories through a [`ModuleResolver`]; a manifest without `main` only
//! contributes static entries and gets a [`StaticModule`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use weave_plugin_api::PluginManifest;
use weave_plugin_sdk::NodeDefinition;

use crate::context::PluginContext;
use crate::sandbox::PluginApi;

/// Code behind a plugin
///
/// Both lifecycle hooks default to doing nothing.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use weave_plugin_host::{PluginApi, PluginContext, PluginModule};
///
/// struct Counter;
///
/// #[async_trait]
/// impl PluginModule for Counter {
///     async fn activate(&self, _ctx: PluginContext, api: PluginApi) -> anyhow::Result<()> {
///         let storage = api.storage()?;
///         let count = storage.get("activations").await?.and_then(|v| v.as_u64()).unwrap_or(0);
///         storage.set("activations", (count + 1).into()).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait PluginModule: Send + Sync {
    async fn activate(&self, ctx: PluginContext, api: PluginApi) -> anyhow::Result<()> {
        let _ = (ctx, api);
        Ok(())
    }

    async fn deactivate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Executable nodes this module provides
    fn nodes(&self) -> Vec<NodeDefinition> {
        Vec::new()
    }
}

/// Module for manifests without an entry point
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticModule;

impl PluginModule for StaticModule {}

pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn PluginModule> + Send + Sync>;

/// Malformed module shape, detected at load time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Plugin '{0}' declares an empty entry point")]
    EmptyEntry(String),

    #[error("Plugin '{plugin_id}' entry point '{entry}' is not registered with the host")]
    UnknownEntry { plugin_id: String, entry: String },
}

/// Maps manifest entry points to module factories
#[derive(Clone, Default)]
pub struct ModuleResolver {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, M>(&mut self, entry: impl Into<String>, factory: F)
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: PluginModule + 'static,
    {
        let factory: ModuleFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn PluginModule>);
        self.factories.insert(entry.into(), factory);
    }

    pub fn with<F, M>(mut self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: PluginModule + 'static,
    {
        self.register(entry, factory);
        self
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }

    /// A fresh module instance for `manifest`
    pub fn resolve(&self, manifest: &PluginManifest) -> Result<Arc<dyn PluginModule>, ConfigurationError> {
        let entry = match manifest.main.as_deref() {
            None => return Ok(Arc::new(StaticModule)),
            Some(entry) => entry.trim(),
        };

        if entry.is_empty() {
            return Err(ConfigurationError::EmptyEntry(manifest.id.clone()));
        }

        self.factories
            .get(entry)
            .map(|factory| factory())
            .ok_or_else(|| ConfigurationError::UnknownEntry {
                plugin_id: manifest.id.clone(),
                entry: entry.to_string(),
            })
    }
}

impl fmt::Debug for ModuleResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<&String> = self.factories.keys().collect();
        entries.sort();
        f.debug_struct("ModuleResolver")
            .field("entries", &entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(main: Option<&str>) -> PluginManifest {
        let mut raw = json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "category": "custom",
        });
        if let Some(main) = main {
            raw["main"] = json!(main);
        }
        PluginManifest::from_value(raw).unwrap()
    }

    struct Noop;
    impl PluginModule for Noop {}

    #[test]
    fn test_resolve_cases() {
        let resolver = ModuleResolver::new().with("demo/index", || Noop);

        assert!(resolver.resolve(&manifest(None)).is_ok());
        assert!(resolver.resolve(&manifest(Some("demo/index"))).is_ok());
        assert_eq!(
            resolver.resolve(&manifest(Some("  "))).err(),
            Some(ConfigurationError::EmptyEntry("demo".into()))
        );
        assert!(matches!(
            resolver.resolve(&manifest(Some("missing"))),
            Err(ConfigurationError::UnknownEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_static_module_is_noop() {
        let module = StaticModule;
        assert!(module.deactivate().await.is_ok());
        assert!(module.nodes().is_empty());
    }
}
