//! Host configuration and ready-made setups
//!
//! [`HostConfig`] bundles everything the loader, registry and installer
//! need. Build one with [`HostConfigBuilder`] or start from a
//! [`HostPresets`] entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditSink, FileAuditSink, NullAuditSink, PermissionAuditor};
use crate::sandbox::{
    AutoConfirmationHandler, ConfirmationHandler, FileGrantStore, GrantStore, HostApi,
    MemoryGrantStore, PermissionPolicy, ReadOnlyGrantStore, ResourceLimits,
    TerminalConfirmationHandler,
};
use crate::signature::TrustStore;

/// Application version reported to compatibility checks by default
pub const DEFAULT_APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_APP_NAME: &str = "weave";

/// Complete host configuration
#[derive(Clone)]
pub struct HostConfig {
    pub plugins_dir: PathBuf,
    pub trust: TrustStore,
    /// Signatures must chain to the trust store, not just verify
    pub require_trusted: bool,
    pub policy: PermissionPolicy,
    pub confirmation: Arc<dyn ConfirmationHandler>,
    pub grant_store: Arc<dyn GrantStore>,
    pub audit: Arc<dyn AuditSink>,
    pub limits: ResourceLimits,
    pub activation_timeout: Duration,
    pub app_version: String,
    pub allow_unsigned: bool,
    pub host_api: HostApi,
}

impl HostConfig {
    pub fn auditor(&self) -> PermissionAuditor {
        PermissionAuditor::new(self.audit.clone())
    }
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("plugins_dir", &self.plugins_dir)
            .field("trusted_keys", &self.trust.len())
            .field("require_trusted", &self.require_trusted)
            .field("policy", &self.policy)
            .field("limits", &self.limits)
            .field("activation_timeout", &self.activation_timeout)
            .field("app_version", &self.app_version)
            .field("allow_unsigned", &self.allow_unsigned)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("Failed to initialize grant store: {0}")]
    StoreInit(String),

    #[error("Failed to initialize audit: {0}")]
    AuditInit(String),
}

fn config_dir(app_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(app_name)
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct HostConfigBuilder {
    app_name: Option<String>,
    plugins_dir: Option<PathBuf>,
    trust: TrustStore,
    require_trusted: bool,
    policy: Option<PermissionPolicy>,
    confirmation: Option<Arc<dyn ConfirmationHandler>>,
    grant_store: Option<Arc<dyn GrantStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    limits: Option<ResourceLimits>,
    activation_timeout: Option<Duration>,
    app_version: Option<String>,
    allow_unsigned: bool,
    host_api: Option<HostApi>,
}

impl HostConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Used for default paths under the user's config directory
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn plugins_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.plugins_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn trust(mut self, trust: TrustStore) -> Self {
        self.trust = trust;
        self
    }

    pub fn require_trusted(mut self, require: bool) -> Self {
        self.require_trusted = require;
        self
    }

    pub fn policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn confirmation(mut self, handler: impl ConfirmationHandler + 'static) -> Self {
        self.confirmation = Some(Arc::new(handler));
        self
    }

    pub fn shared_confirmation(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation = Some(handler);
        self
    }

    pub fn grant_store(mut self, store: impl GrantStore + 'static) -> Self {
        self.grant_store = Some(Arc::new(store));
        self
    }

    pub fn shared_grant_store(mut self, store: Arc<dyn GrantStore>) -> Self {
        self.grant_store = Some(store);
        self
    }

    pub fn audit(mut self, sink: impl AuditSink + 'static) -> Self {
        self.audit = Some(Arc::new(sink));
        self
    }

    pub fn shared_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = Some(timeout);
        self
    }

    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    pub fn allow_unsigned(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }

    pub fn host_api(mut self, api: HostApi) -> Self {
        self.host_api = Some(api);
        self
    }

    pub fn build(self) -> Result<HostConfig, PresetError> {
        let app_name = self.app_name.as_deref().unwrap_or(DEFAULT_APP_NAME);

        let grant_store: Arc<dyn GrantStore> = match self.grant_store {
            Some(store) => store,
            None => Arc::new(
                FileGrantStore::default_for_app(app_name).map_err(|e| PresetError::StoreInit(e.to_string()))?,
            ),
        };

        Ok(HostConfig {
            plugins_dir: self
                .plugins_dir
                .unwrap_or_else(|| config_dir(app_name).join("plugins")),
            trust: self.trust,
            require_trusted: self.require_trusted,
            policy: self.policy.unwrap_or_default(),
            confirmation: self
                .confirmation
                .unwrap_or_else(|| Arc::new(TerminalConfirmationHandler::new())),
            grant_store,
            audit: self.audit.unwrap_or_else(|| Arc::new(NullAuditSink)),
            limits: self.limits.unwrap_or_default(),
            activation_timeout: self.activation_timeout.unwrap_or(DEFAULT_ACTIVATION_TIMEOUT),
            app_version: self
                .app_version
                .unwrap_or_else(|| DEFAULT_APP_VERSION.to_string()),
            allow_unsigned: self.allow_unsigned,
            host_api: self.host_api.unwrap_or_else(HostApi::in_memory),
        })
    }
}

// ============================================================================
// Preset Configurations
// ============================================================================

pub struct HostPresets;

impl HostPresets {
    /// Desktop use
    ///
    /// - Default policy, terminal confirmation
    /// - Grants in `grants.json`, audit log in `audit.jsonl`
    /// - Signed packages required
    pub fn interactive(app_name: &str) -> Result<HostConfigBuilder, PresetError> {
        let dir = config_dir(app_name);
        let store = FileGrantStore::new(dir.join("grants.json")).map_err(|e| PresetError::StoreInit(e.to_string()))?;
        let audit = FileAuditSink::new(dir.join("audit.jsonl")).map_err(|e| PresetError::AuditInit(e.to_string()))?;

        Ok(HostConfigBuilder::new()
            .app_name(app_name)
            .plugins_dir(dir.join("plugins"))
            .grant_store(store)
            .audit(audit)
            .confirmation(TerminalConfirmationHandler::new()))
    }

    /// Unattended runs
    ///
    /// - Grants are read-only: only pre-approved permissions are used
    /// - Anything needing confirmation is denied
    /// - Signatures must chain to a trusted key
    pub fn ci(app_name: &str) -> Result<HostConfigBuilder, PresetError> {
        let dir = config_dir(app_name);
        let store = FileGrantStore::new(dir.join("grants.json")).map_err(|e| PresetError::StoreInit(e.to_string()))?;
        let audit = FileAuditSink::new(dir.join("audit.jsonl")).map_err(|e| PresetError::AuditInit(e.to_string()))?;

        Ok(HostConfigBuilder::new()
            .app_name(app_name)
            .plugins_dir(dir.join("plugins"))
            .grant_store(ReadOnlyGrantStore::new(store))
            .audit(audit)
            .confirmation(AutoConfirmationHandler::always_deny())
            .require_trusted(true))
    }

    /// In-memory everything, approvals granted, unsigned packages allowed
    pub fn testing() -> HostConfigBuilder {
        HostConfigBuilder::new()
            .plugins_dir(std::env::temp_dir().join("weave-test-plugins"))
            .grant_store(MemoryGrantStore::new())
            .audit(NullAuditSink)
            .confirmation(AutoConfirmationHandler::always_approve())
            .allow_unsigned(true)
            .activation_timeout(Duration::from_secs(2))
    }
}
