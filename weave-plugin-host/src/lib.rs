//! weave-plugin-host: plugin host runtime for weave
//!
//! This crate verifies, sandboxes, loads and manages plugins:
//!
//! - [`signature`]: package checksums and ed25519 signatures
//! - [`sandbox`]: permission policy, grants and the capability-checked [`PluginApi`]
//! - [`loader`] / [`registry`]: activation, lifecycle and hot swapping
//! - [`installer`], [`discovery`], [`watcher`]: getting plugins onto disk and keeping them current
//! - [`marketplace`]: publishing packages

pub mod audit;
pub mod context;
pub mod disabled;
pub mod discovery;
pub mod disposable;
pub mod history;
pub mod installer;
pub mod loader;
pub mod marketplace;
pub mod module;
pub mod presets;
pub mod registry;
pub mod sandbox;
pub mod signature;
pub mod state;
pub mod watcher;

pub use audit::{
    AuditAction, AuditEntry, AuditSink, CompositeAuditSink, FileAuditSink, MemoryAuditSink,
    NullAuditSink, PermissionAuditor,
};
pub use context::PluginContext;
pub use disabled::{DisabledError, DisabledPlugins};
pub use discovery::{default_plugin_dirs, DiscoveryError, DiscoveryResult, PluginScanner};
pub use disposable::{Disposable, DisposableStore, DisposeError};
pub use history::{InstallSource, VersionHistory, VersionRecord};
pub use installer::{
    check_for_updates, InstallOptions, InstallResult, InstallerError, PluginInstaller,
    RegistryIndex, UninstallResult, UpdateInfo,
};
pub use loader::{InstalledPlugin, LoadedPlugin, LoaderError, PluginLoader};
pub use marketplace::{
    DryRunTransport, PublishPayload, PublishRequest, PublishResult, PublishTransport,
    PublisherClient, TransportError, TransportResponse,
};
pub use module::{ConfigurationError, ModuleResolver, PluginModule, StaticModule};
pub use presets::{HostConfig, HostConfigBuilder, HostPresets, PresetError};
pub use registry::{PluginRegistry, RegistryError};
pub use sandbox::{
    create_sandboxed_api, execute_with_timeout, GrantedPermissions, HostApi, PermissionDeniedError,
    PermissionPolicy, PluginApi, PolicyChecker, ResourceLimits, ResourceMonitor,
};
pub use signature::{
    PluginPackage, SignatureFile, SignatureVerificationResult, SignatureVerifier, TrustStore,
};
pub use state::{LifecycleEvent, PluginState, StateError};
pub use watcher::{HotReloadWatcher, WatcherConfig, WatcherError};
pub use weave_plugin_api::{PluginManifest, PluginPermission};
