//! Plugin loader
//!
//! Turns a plugin directory into an active [`LoadedPlugin`]:
//!
//! 1. read and validate `manifest.json`
//! 2. verify `signature.json` (or refuse unless unsigned packages are allowed)
//! 3. validate contributed node descriptors
//! 4. resolve permission grants
//! 5. build the sandboxed API
//! 6. create a fresh [`PluginContext`]
//! 7. resolve the module for the manifest's entry point
//! 8. run `activate` under the activation timeout
//!
//! A grant the user asked to remember is only written once activation
//! succeeded. Plugins on the disabled list skip grants and activation and
//! come back as `Disabled`.
//!
//! Any failure is audited and returned. Effects a plugin already had before
//! failing (storage writes, outgoing requests) are not rolled back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use weave_plugin_api::{
    check_compatibility, IssueKind, ManifestError, PluginManifest, PluginPermission, Severity,
};
use weave_plugin_sdk::{validate_node_definition, NodeDefinition, ValidationError};

use crate::audit::{AuditAction, AuditEntry, PermissionAuditor};
use crate::context::PluginContext;
use crate::disabled::DisabledPlugins;
use crate::module::{ConfigurationError, ModuleResolver, PluginModule};
use crate::presets::HostConfig;
use crate::sandbox::{
    create_sandboxed_api, decide_grants, execute_with_timeout, GrantedPermissions, HostApiError,
    PermissionDeniedError, PluginApi, PolicyChecker, ResourceEvent, ResourceMonitor, TimeoutError,
};
use crate::signature::{
    canonical_payload, compute_checksum, parse_signature_file, PluginPackage, SignatureFile,
    SignatureFileError, SignatureVerificationResult, SignatureVerifier, MANIFEST_FILE_NAME,
    SIGNATURE_FILE_NAME,
};
use crate::state::{LifecycleEvent, PluginState, StateError};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Failed to read manifest at {}: {source}", .path.display())]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Plugin '{plugin_id}' is not compatible with this host: {}", .issues.join("; "))]
    Incompatible { plugin_id: String, issues: Vec<String> },

    #[error("Plugin '{0}' is not signed")]
    Unsigned(String),

    #[error(transparent)]
    SignatureFile(#[from] SignatureFileError),

    #[error("Signature verification failed for '{plugin_id}': {}", codes(.result))]
    Signature {
        plugin_id: String,
        result: SignatureVerificationResult,
    },

    #[error("Plugin '{plugin_id}' contributes an invalid node '{node}' ({} error(s))", .errors.len())]
    InvalidNode {
        plugin_id: String,
        node: String,
        errors: Vec<ValidationError>,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    PermissionDenied(#[from] PermissionDeniedError),

    #[error("Activation of '{plugin_id}' failed: {message}")]
    Activation { plugin_id: String, message: String },

    #[error("Activation of '{plugin_id}' did not finish: {source}")]
    Timeout {
        plugin_id: String,
        #[source]
        source: TimeoutError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn codes(result: &SignatureVerificationResult) -> String {
    result
        .errors
        .iter()
        .map(|e| e.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl LoaderError {
    /// Id of the plugin the error concerns, when it is known
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Incompatible { plugin_id, .. }
            | Self::Signature { plugin_id, .. }
            | Self::InvalidNode { plugin_id, .. }
            | Self::Activation { plugin_id, .. }
            | Self::Timeout { plugin_id, .. } => Some(plugin_id),
            Self::Unsigned(id) => Some(id),
            Self::PermissionDenied(e) => Some(&e.plugin_id),
            Self::Configuration(ConfigurationError::EmptyEntry(id)) => Some(id),
            Self::Configuration(ConfigurationError::UnknownEntry { plugin_id, .. }) => Some(plugin_id),
            _ => None,
        }
    }
}

/// Serializable snapshot of a loaded plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub manifest: PluginManifest,
    pub state: PluginState,
    pub installed_at: DateTime<Utc>,
    pub source_checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureFile>,
    pub granted: Vec<PluginPermission>,
    pub path: PathBuf,
}

/// An activated plugin
///
/// Handles are never mutated after the registry hands them out, except for
/// their lifecycle state. A reload produces a new handle.
pub struct LoadedPlugin {
    pub manifest: Arc<PluginManifest>,
    pub path: PathBuf,
    pub installed_at: DateTime<Utc>,
    /// SHA-256 over the package's canonical checksum listing
    pub source_checksum: String,
    pub signature: Option<SignatureFile>,
    pub granted: GrantedPermissions,
    state: Mutex<PluginState>,
    module: Arc<dyn PluginModule>,
    context: PluginContext,
    api: PluginApi,
    nodes: Vec<NodeDefinition>,
}

impl LoadedPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn state(&self) -> PluginState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a lifecycle event, returning the new state
    pub fn transition(&self, event: LifecycleEvent) -> Result<PluginState, StateError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = state.transition(event)?;
        tracing::debug!(plugin = %self.manifest.id, from = %*state, to = %next, "State transition");
        *state = next;
        Ok(next)
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn api(&self) -> &PluginApi {
        &self.api
    }

    /// Executable nodes provided by the module
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    pub fn info(&self) -> InstalledPlugin {
        InstalledPlugin {
            manifest: (*self.manifest).clone(),
            state: self.state(),
            installed_at: self.installed_at,
            source_checksum: self.source_checksum.clone(),
            signature: self.signature.clone(),
            granted: self.granted.iter().collect(),
            path: self.path.clone(),
        }
    }

    /// Run `deactivate`, then dispose subscriptions last-first
    ///
    /// Failures are logged and audited but never stop the teardown. Ends in
    /// `Installed`.
    pub(crate) async fn shutdown(&self, auditor: &PermissionAuditor) -> Result<(), StateError> {
        let id = self.id().to_string();
        self.transition(LifecycleEvent::Deactivate)?;

        let deactivated = match self.module.deactivate().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(plugin = %id, error = %format!("{:#}", e), "Plugin deactivate failed");
                false
            }
        };

        for failure in self.context.subscriptions().dispose_all() {
            tracing::warn!(plugin = %id, label = %failure.label, error = %failure.message, "Disposal failed");
        }

        self.transition(LifecycleEvent::Deactivated)?;
        auditor.lifecycle(&id, "deactivate", deactivated);
        tracing::info!(plugin = %id, "Plugin deactivated");
        Ok(())
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .field("state", &self.state())
            .field("path", &self.path)
            .field("granted", &self.granted)
            .finish_non_exhaustive()
    }
}

/// Loads plugin directories according to a [`HostConfig`]
pub struct PluginLoader {
    config: HostConfig,
    verifier: SignatureVerifier,
    policy: PolicyChecker,
    resolver: ModuleResolver,
    auditor: PermissionAuditor,
    monitor: ResourceMonitor,
    disabled: DisabledPlugins,
    resource_events: Mutex<Option<mpsc::UnboundedReceiver<ResourceEvent>>>,
}

impl PluginLoader {
    pub fn new(config: HostConfig, resolver: ModuleResolver) -> Self {
        let auditor = config.auditor();
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = ResourceMonitor::new(config.limits, auditor.clone()).with_notifier(tx);

        Self {
            verifier: SignatureVerifier::new(config.trust.clone()).require_trusted(config.require_trusted),
            policy: PolicyChecker::new(config.policy.clone()),
            resolver,
            auditor,
            monitor,
            disabled: DisabledPlugins::in_dir(&config.plugins_dir),
            resource_events: Mutex::new(Some(rx)),
            config,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn auditor(&self) -> &PermissionAuditor {
        &self.auditor
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Persisted list of plugins that load without activating
    pub fn disabled(&self) -> &DisabledPlugins {
        &self.disabled
    }

    /// Limit breach events; can be taken once
    pub fn take_resource_events(&self) -> Option<mpsc::UnboundedReceiver<ResourceEvent>> {
        self.resource_events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Load and activate the plugin in `path`
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<LoadedPlugin, LoaderError> {
        let path = path.as_ref();
        match self.load_inner(path).await {
            Ok(plugin) if plugin.state() == PluginState::Disabled => {
                tracing::info!(
                    plugin = %plugin.id(),
                    version = %plugin.version(),
                    path = %path.display(),
                    "Plugin is disabled; not activated"
                );
                Ok(plugin)
            }
            Ok(plugin) => {
                self.auditor.lifecycle(plugin.id(), "activate", true);
                tracing::info!(
                    plugin = %plugin.id(),
                    version = %plugin.version(),
                    path = %path.display(),
                    "Plugin activated"
                );
                Ok(plugin)
            }
            Err(e) => {
                let id = e
                    .plugin_id()
                    .map(str::to_string)
                    .unwrap_or_else(|| path.display().to_string());
                self.auditor.record(
                    AuditEntry::new(&id, AuditAction::Lifecycle, false).with_reason(format!("load failed: {}", e)),
                );
                tracing::warn!(plugin = %id, path = %path.display(), error = %e, "Plugin failed to load");
                Err(e)
            }
        }
    }

    async fn load_inner(&self, path: &Path) -> Result<LoadedPlugin, LoaderError> {
        // 1. Manifest
        let manifest_path = path.join(MANIFEST_FILE_NAME);
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|source| LoaderError::ManifestRead {
                path: manifest_path.clone(),
                source,
            })?;
        let manifest = PluginManifest::from_json(&raw)?;
        self.check_app_version(&manifest)?;

        // 2. Package contents and signature
        let dir = path.to_path_buf();
        let package = tokio::task::spawn_blocking(move || PluginPackage::from_dir(&dir)).await??;
        let signature = self.verify_signature(path, &manifest, &package).await?;
        let source_checksum = package_checksum(&package);

        // 3. Contributed nodes
        for (index, descriptor) in manifest.contributes.nodes.iter().enumerate() {
            let result = validate_node_definition(descriptor);
            if !result.valid {
                let node = descriptor
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{}", index));
                return Err(LoaderError::InvalidNode {
                    plugin_id: manifest.id.clone(),
                    node,
                    errors: result.errors,
                });
            }
        }

        // 4. Grants
        let disabled = self.disabled.contains(&manifest.id);
        let decision = if disabled {
            None
        } else {
            let manifest = manifest.clone();
            let policy = self.policy.clone();
            let confirmation = self.config.confirmation.clone();
            let store = self.config.grant_store.clone();
            let auditor = self.auditor.clone();
            let decision = tokio::task::spawn_blocking(move || {
                decide_grants(&manifest, &policy, confirmation.as_ref(), store.as_ref(), &auditor)
            })
            .await?;
            Some(decision)
        };
        let granted = decision
            .as_ref()
            .map(|d| d.granted.clone())
            .unwrap_or_default();

        // 5. Sandbox
        let api = create_sandboxed_api(
            &manifest.id,
            granted.clone(),
            self.config.host_api.clone(),
            self.auditor.clone(),
            self.monitor.clone(),
        );

        // 6. Context
        let manifest = Arc::new(manifest);
        let context = PluginContext::new(manifest.clone(), path);

        // 7. Module
        let module = self.resolver.resolve(&manifest)?;

        let plugin = LoadedPlugin {
            nodes: module.nodes(),
            manifest,
            path: path.to_path_buf(),
            installed_at: Utc::now(),
            source_checksum,
            signature,
            granted,
            state: Mutex::new(PluginState::Installed),
            module,
            context,
            api,
        };

        if disabled {
            plugin.transition(LifecycleEvent::Disable)?;
            return Ok(plugin);
        }

        // 8. Activation
        self.activate(&plugin).await?;
        if let Some(decision) = decision {
            decision.commit(plugin.id(), self.config.grant_store.as_ref());
        }
        Ok(plugin)
    }

    fn check_app_version(&self, manifest: &PluginManifest) -> Result<(), LoaderError> {
        let result = check_compatibility(manifest, &self.config.app_version, &[]);
        let mut issues = Vec::new();
        for issue in result.issues.iter().filter(|i| i.kind == IssueKind::AppVersion) {
            match issue.severity {
                Severity::Error => issues.push(issue.message.clone()),
                Severity::Warning => {
                    tracing::warn!(plugin = %manifest.id, issue = %issue.message, "Compatibility warning")
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(LoaderError::Incompatible {
                plugin_id: manifest.id.clone(),
                issues,
            })
        }
    }

    async fn verify_signature(
        &self,
        path: &Path,
        manifest: &PluginManifest,
        package: &PluginPackage,
    ) -> Result<Option<SignatureFile>, LoaderError> {
        let signature_path = path.join(SIGNATURE_FILE_NAME);
        let content = match tokio::fs::read_to_string(&signature_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.config.allow_unsigned {
                    tracing::warn!(plugin = %manifest.id, "Loading unsigned plugin");
                    return Ok(None);
                }
                return Err(LoaderError::Unsigned(manifest.id.clone()));
            }
            Err(e) => return Err(SignatureFileError::Io(e).into()),
        };

        let signature = parse_signature_file(&content)?;
        let result = self.verifier.verify(package, &signature);
        for warning in &result.warnings {
            tracing::warn!(plugin = %manifest.id, code = %warning.code, "{}", warning.message);
        }
        if !result.valid {
            return Err(LoaderError::Signature {
                plugin_id: manifest.id.clone(),
                result,
            });
        }

        tracing::debug!(plugin = %manifest.id, signer = %signature.signer.name, trusted = result.trusted, "Signature verified");
        Ok(Some(signature))
    }

    async fn activate(&self, plugin: &LoadedPlugin) -> Result<(), LoaderError> {
        let id = plugin.id().to_string();
        plugin.transition(LifecycleEvent::Activate)?;

        let module = plugin.module.clone();
        let context = plugin.context.clone();
        let api = plugin.api.clone();
        let outcome = execute_with_timeout(
            async move { module.activate(context, api).await },
            self.config.activation_timeout,
        )
        .await;

        let error = match outcome {
            Ok(Ok(())) => {
                plugin.transition(LifecycleEvent::Activated)?;
                return Ok(());
            }
            Ok(Err(e)) => activation_error(&id, e),
            Err(source) => LoaderError::Timeout {
                plugin_id: id.clone(),
                source,
            },
        };

        plugin.transition(LifecycleEvent::Fail)?;
        // Registrations made before the failure would otherwise leak
        for failure in plugin.context.subscriptions().dispose_all() {
            tracing::warn!(plugin = %id, label = %failure.label, error = %failure.message, "Disposal failed");
        }
        Err(error)
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

/// A permission denial that escapes `activate` keeps its type
fn activation_error(plugin_id: &str, error: anyhow::Error) -> LoaderError {
    if let Some(denied) = error.downcast_ref::<PermissionDeniedError>() {
        return LoaderError::PermissionDenied(denied.clone());
    }
    if let Some(HostApiError::PermissionDenied(denied)) = error.downcast_ref::<HostApiError>() {
        return LoaderError::PermissionDenied(denied.clone());
    }
    LoaderError::Activation {
        plugin_id: plugin_id.to_string(),
        message: format!("{:#}", error),
    }
}

fn package_checksum(package: &PluginPackage) -> String {
    let files: BTreeMap<String, String> = package
        .files
        .iter()
        .map(|(name, data)| (name.clone(), compute_checksum(data)))
        .collect();
    compute_checksum(&canonical_payload(&package.manifest.id, &package.manifest.version, &files))
}
