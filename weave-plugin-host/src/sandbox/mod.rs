//! Permission and sandbox layer
//!
//! # Architecture
//!
//! ```text
//! manifest ──▶ PolicyChecker::evaluate ──▶ auto / approval / denied
//!                                               │
//!                     ConfirmationHandler ◀─────┘
//!                               │
//!                               ▼
//!        GrantStore ◀──── GrantedPermissions (immutable)
//!                               │
//!                               ▼
//!   HostApi ──▶ create_sandboxed_api ──▶ PluginApi facets ──▶ PermissionChecker
//!                                               │                    │
//!                                         ResourceMonitor     PermissionAuditor
//! ```
//!
//! The sandbox intercepts capability access; it does not isolate code.

pub mod api;
pub mod backends;
pub mod checker;
pub mod confirm;
pub mod host;
pub mod monitor;
pub mod policy;
pub mod store;
pub mod timeout;

pub use api::{
    create_sandboxed_api, ClipboardApi, CommandsApi, EnvApi, EventsApi, ExecutionsApi, HostApiError,
    HttpApi, NotificationsApi, PluginApi, SecretsApi, StorageApi, WorkflowsApi,
};
pub use backends::{
    CollectingNotifications, MemoryClipboard, MemoryEnv, MemoryExecutions, MemorySecrets,
    MemoryStorage, MemoryWorkflows, StaticHttp,
};
pub use checker::{GrantedPermissions, PermissionChecker, PermissionDeniedError};
pub use confirm::{
    AutoConfirmationHandler, ConfirmationError, ConfirmationHandler, ConfirmationRequest,
    ConfirmationResult, RecordingConfirmationHandler, TerminalConfirmationHandler,
};
pub use host::{
    BackendError, ClipboardBackend, CommandError, CommandHandler, CommandRegistry, EnvBackend, EventBus,
    EventHandler, ExecutionBackend, HostApi, HttpBackend, HttpRequest, HttpResponse, Notification,
    NotificationBackend, NotificationLevel, SecretsBackend, StorageBackend, WorkflowBackend,
    WorkflowSummary,
};
pub use monitor::{ResourceEvent, ResourceLimits, ResourceMonitor, ResourceUsage};
pub use policy::{decide_grants, resolve_grants, GrantDecision, PermissionPolicy, PolicyChecker, PolicyEvaluation, Resolution};
pub use store::{FileGrantStore, GrantStore, MemoryGrantStore, ReadOnlyGrantStore, StoreError, StoredGrant};
pub use timeout::{execute_with_timeout, TimeoutError};
