//! The sandboxed API handed to a plugin's `activate`
//!
//! Each capability is a facet. Asking for a facet whose permission was not
//! granted returns [`PermissionDeniedError`] instead of the facet, so a
//! plugin can never hold a handle to something it may not use. Every facet
//! call is timed and reported to the [`ResourceMonitor`].

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use weave_plugin_api::PluginPermission;
use weave_plugin_sdk::BoxFuture;

use super::checker::{GrantedPermissions, PermissionChecker, PermissionDeniedError};
use super::host::{
    BackendError, ClipboardBackend, CommandError, CommandHandler, CommandRegistry, EnvBackend, EventBus,
    EventHandler, ExecutionBackend, HostApi, HttpBackend, HttpRequest, HttpResponse, Notification,
    NotificationBackend, NotificationLevel, SecretsBackend, StorageBackend, WorkflowBackend,
    WorkflowSummary,
};
use super::monitor::ResourceMonitor;
use crate::audit::PermissionAuditor;
use crate::disposable::Disposable;

#[derive(Debug, Error)]
pub enum HostApiError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDeniedError),

    #[error("Host backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plugin '{0}' is suspended for exceeding resource limits")]
    Suspended(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Shared by every facet of one plugin
#[derive(Clone)]
struct FacetContext {
    plugin_id: Arc<str>,
    checker: PermissionChecker,
    monitor: ResourceMonitor,
}

impl FacetContext {
    /// Run a backend call, refusing it if the plugin was flagged
    async fn call<T, F>(&self, fut: F) -> Result<T, HostApiError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        if self.monitor.is_flagged(&self.plugin_id) {
            return Err(HostApiError::Suspended(self.plugin_id.to_string()));
        }
        let started = Instant::now();
        let result = fut.await;
        self.monitor.record(&self.plugin_id, started.elapsed());
        Ok(result?)
    }
}

/// Build the API for one plugin from its final grant
pub fn create_sandboxed_api(
    plugin_id: &str,
    granted: GrantedPermissions,
    host_api: HostApi,
    auditor: PermissionAuditor,
    monitor: ResourceMonitor,
) -> PluginApi {
    let plugin_id: Arc<str> = Arc::from(plugin_id);
    PluginApi {
        ctx: FacetContext {
            checker: PermissionChecker::new(plugin_id.clone(), granted, auditor),
            plugin_id,
            monitor,
        },
        host: host_api,
    }
}

#[derive(Clone)]
pub struct PluginApi {
    ctx: FacetContext,
    host: HostApi,
}

impl PluginApi {
    pub fn plugin_id(&self) -> &str {
        &self.ctx.plugin_id
    }

    /// Whether `permission` was granted; no audit entry
    pub fn has(&self, permission: PluginPermission) -> bool {
        self.ctx.checker.has(permission)
    }

    pub fn granted(&self) -> &GrantedPermissions {
        self.ctx.checker.granted()
    }

    pub fn storage(&self) -> Result<StorageApi, PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::Storage)?;
        Ok(StorageApi {
            prefix: format!("plugin:{}:", self.ctx.plugin_id),
            ctx: self.ctx.clone(),
            backend: self.host.storage.clone(),
        })
    }

    pub fn http(&self) -> Result<HttpApi, PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::Network)?;
        Ok(HttpApi {
            ctx: self.ctx.clone(),
            backend: self.host.http.clone(),
        })
    }

    /// Requires `workflows.read` or `workflows.write`; each method checks again
    pub fn workflows(&self) -> Result<WorkflowsApi, PermissionDeniedError> {
        self.ctx
            .checker
            .check_any(&[PluginPermission::WorkflowsRead, PluginPermission::WorkflowsWrite])?;
        Ok(WorkflowsApi {
            ctx: self.ctx.clone(),
            backend: self.host.workflows.clone(),
        })
    }

    pub fn executions(&self) -> Result<ExecutionsApi, PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::ExecutionsRun)?;
        Ok(ExecutionsApi {
            ctx: self.ctx.clone(),
            backend: self.host.executions.clone(),
        })
    }

    pub fn notifications(&self) -> Result<NotificationsApi, PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::UiNotifications)?;
        Ok(NotificationsApi {
            ctx: self.ctx.clone(),
            backend: self.host.notifications.clone(),
        })
    }

    pub fn secrets(&self) -> Result<SecretsApi, PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::Secrets)?;
        Ok(SecretsApi {
            ctx: self.ctx.clone(),
            backend: self.host.secrets.clone(),
        })
    }

    pub fn env(&self) -> Result<EnvApi, PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::Env)?;
        Ok(EnvApi {
            ctx: self.ctx.clone(),
            backend: self.host.env.clone(),
        })
    }

    pub fn clipboard(&self) -> Result<ClipboardApi, PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::Clipboard)?;
        Ok(ClipboardApi {
            ctx: self.ctx.clone(),
            backend: self.host.clipboard.clone(),
        })
    }

    /// Command registration needs no permission
    pub fn commands(&self) -> CommandsApi {
        CommandsApi {
            ctx: self.ctx.clone(),
            registry: self.host.commands.clone(),
        }
    }

    /// Event subscription needs no permission
    pub fn events(&self) -> EventsApi {
        EventsApi {
            ctx: self.ctx.clone(),
            bus: self.host.events.clone(),
        }
    }
}

impl fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApi")
            .field("plugin_id", &self.ctx.plugin_id)
            .field("granted", self.ctx.checker.granted())
            .finish()
    }
}

// ============================================================================
// Facets
// ============================================================================

/// Key-value storage, namespaced to the plugin
pub struct StorageApi {
    prefix: String,
    ctx: FacetContext,
    backend: Arc<dyn StorageBackend>,
}

impl StorageApi {
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, HostApiError> {
        let key = self.key(key);
        self.ctx.call(self.backend.get(&key)).await
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), HostApiError> {
        let key = self.key(key);
        self.ctx.call(self.backend.set(&key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, HostApiError> {
        let key = self.key(key);
        self.ctx.call(self.backend.delete(&key)).await
    }

    /// Keys owned by this plugin, without the namespace prefix
    pub async fn keys(&self) -> Result<Vec<String>, HostApiError> {
        let keys = self.ctx.call(self.backend.keys(&self.prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

pub struct HttpApi {
    ctx: FacetContext,
    backend: Arc<dyn HttpBackend>,
}

impl HttpApi {
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HostApiError> {
        tracing::debug!(
            plugin = %self.ctx.plugin_id,
            method = %request.method,
            url = %request.url,
            "Plugin HTTP request"
        );
        self.ctx.call(self.backend.request(request)).await
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, HostApiError> {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post(&self, url: &str, body: Value) -> Result<HttpResponse, HostApiError> {
        self.request(HttpRequest::post(url, body)).await
    }
}

impl fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpApi")
            .field("plugin_id", &self.ctx.plugin_id)
            .finish_non_exhaustive()
    }
}

pub struct WorkflowsApi {
    ctx: FacetContext,
    backend: Arc<dyn WorkflowBackend>,
}

impl WorkflowsApi {
    fn can_read(&self) -> Result<(), PermissionDeniedError> {
        self.ctx
            .checker
            .check_any(&[PluginPermission::WorkflowsRead, PluginPermission::WorkflowsWrite])
    }

    fn can_write(&self) -> Result<(), PermissionDeniedError> {
        self.ctx.checker.check(PluginPermission::WorkflowsWrite)
    }

    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, HostApiError> {
        self.can_read()?;
        self.ctx.call(self.backend.list()).await
    }

    pub async fn get(&self, id: &str) -> Result<Value, HostApiError> {
        self.can_read()?;
        self.ctx
            .call(self.backend.get(id))
            .await?
            .ok_or_else(|| HostApiError::NotFound(format!("workflow '{}'", id)))
    }

    pub async fn create(&self, workflow: Value) -> Result<String, HostApiError> {
        self.can_write()?;
        self.ctx.call(self.backend.create(workflow)).await
    }

    pub async fn update(&self, id: &str, workflow: Value) -> Result<(), HostApiError> {
        self.can_write()?;
        self.ctx.call(self.backend.update(id, workflow)).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, HostApiError> {
        self.can_write()?;
        self.ctx.call(self.backend.delete(id)).await
    }
}

pub struct ExecutionsApi {
    ctx: FacetContext,
    backend: Arc<dyn ExecutionBackend>,
}

impl ExecutionsApi {
    pub async fn run(&self, workflow_id: &str, input: Value) -> Result<String, HostApiError> {
        self.ctx.call(self.backend.run(workflow_id, input)).await
    }

    pub async fn status(&self, execution_id: &str) -> Result<Value, HostApiError> {
        self.ctx
            .call(self.backend.status(execution_id))
            .await?
            .ok_or_else(|| HostApiError::NotFound(format!("execution '{}'", execution_id)))
    }
}

pub struct NotificationsApi {
    ctx: FacetContext,
    backend: Arc<dyn NotificationBackend>,
}

impl NotificationsApi {
    pub async fn show(
        &self,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), HostApiError> {
        let notification = Notification {
            plugin_id: self.ctx.plugin_id.to_string(),
            level,
            title: title.into(),
            message: message.into(),
        };
        self.ctx.call(self.backend.notify(notification)).await
    }

    pub async fn info(&self, title: impl Into<String>, message: impl Into<String>) -> Result<(), HostApiError> {
        self.show(NotificationLevel::Info, title, message).await
    }
}

pub struct SecretsApi {
    ctx: FacetContext,
    backend: Arc<dyn SecretsBackend>,
}

impl SecretsApi {
    pub async fn get(&self, name: &str) -> Result<Option<String>, HostApiError> {
        self.ctx.call(self.backend.get(&self.ctx.plugin_id, name)).await
    }
}

pub struct EnvApi {
    ctx: FacetContext,
    backend: Arc<dyn EnvBackend>,
}

impl EnvApi {
    pub async fn get(&self, name: &str) -> Result<Option<String>, HostApiError> {
        self.ctx.call(self.backend.get(name)).await
    }
}

pub struct ClipboardApi {
    ctx: FacetContext,
    backend: Arc<dyn ClipboardBackend>,
}

impl ClipboardApi {
    pub async fn read(&self) -> Result<Option<String>, HostApiError> {
        self.ctx.call(self.backend.read()).await
    }

    pub async fn write(&self, text: impl Into<String>) -> Result<(), HostApiError> {
        self.ctx.call(self.backend.write(text.into())).await
    }
}

pub struct CommandsApi {
    ctx: FacetContext,
    registry: CommandRegistry,
}

impl CommandsApi {
    /// Register a command handler; push the returned handle onto the
    /// plugin context's subscriptions
    ///
    /// Ids live under the plugin's namespace: `demo` may register
    /// `demo.refresh` but not `refresh` or `other.refresh`.
    pub fn register<F, Fut>(&self, id: impl Into<String>, handler: F) -> Result<Disposable, HostApiError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
    {
        let id = id.into();
        let in_namespace = id
            .strip_prefix(&*self.ctx.plugin_id)
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|name| !name.is_empty());
        if !in_namespace {
            return Err(CommandError::OutsideNamespace {
                id,
                plugin_id: self.ctx.plugin_id.to_string(),
            }
            .into());
        }

        let handler: CommandHandler =
            Arc::new(move |args: Value| -> BoxFuture<'static, Result<Value, BackendError>> { Box::pin(handler(args)) });
        let handle = self.registry.register(&self.ctx.plugin_id, id.clone(), handler)?;
        tracing::debug!(plugin = %self.ctx.plugin_id, command = %id, "Command registered");
        Ok(handle)
    }

    /// Run one of this plugin's own commands
    ///
    /// Commands of other plugins are only reachable from the host side,
    /// through [`CommandRegistry::execute`].
    pub async fn execute(&self, id: &str, args: Value) -> Result<Value, HostApiError> {
        if self.ctx.monitor.is_flagged(&self.ctx.plugin_id) {
            return Err(HostApiError::Suspended(self.ctx.plugin_id.to_string()));
        }
        match self.registry.owner(id) {
            None => return Err(HostApiError::NotFound(format!("command '{}'", id))),
            Some(owner) if owner != *self.ctx.plugin_id => {
                tracing::warn!(plugin = %self.ctx.plugin_id, command = %id, owner = %owner, "Cross-plugin command refused");
                return Err(CommandError::Foreign {
                    id: id.to_string(),
                    plugin_id: self.ctx.plugin_id.to_string(),
                    owner,
                }
                .into());
            }
            Some(_) => {}
        }

        let started = Instant::now();
        let result = self.registry.execute(id, args).await;
        self.ctx.monitor.record(&self.ctx.plugin_id, started.elapsed());
        match result {
            Some(result) => Ok(result?),
            None => Err(HostApiError::NotFound(format!("command '{}'", id))),
        }
    }
}

pub struct EventsApi {
    ctx: FacetContext,
    bus: EventBus,
}

impl EventsApi {
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Disposable
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.bus.on(event, handler)
    }

    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        let started = Instant::now();
        let count = self.bus.emit(event, payload);
        self.ctx.monitor.record(&self.ctx.plugin_id, started.elapsed());
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditSink};
    use crate::sandbox::monitor::ResourceLimits;
    use serde_json::json;
    use std::time::Duration;

    fn api(plugin: &str, permissions: &[PluginPermission], host: HostApi) -> PluginApi {
        create_sandboxed_api(
            plugin,
            permissions.iter().copied().collect(),
            host,
            PermissionAuditor::null(),
            ResourceMonitor::new(ResourceLimits::default(), PermissionAuditor::null()),
        )
    }

    #[tokio::test]
    async fn test_ungranted_facet_is_denied() {
        let sink = Arc::new(MemoryAuditSink::new());
        let api = create_sandboxed_api(
            "demo",
            [PluginPermission::Storage].into_iter().collect(),
            HostApi::in_memory(),
            PermissionAuditor::new(sink.clone()),
            ResourceMonitor::new(ResourceLimits::default(), PermissionAuditor::null()),
        );

        let err = api.http().err().unwrap();
        assert_eq!(err.permission, PluginPermission::Network);
        assert!(api.secrets().is_err());
        assert!(api.storage().is_ok());
        assert!(api.has(PluginPermission::Storage));
        assert!(!api.has(PluginPermission::Network));

        assert_eq!(sink.find_by_action(AuditAction::Denied).len(), 2);
    }

    #[tokio::test]
    async fn test_storage_is_namespaced() {
        let host = HostApi::in_memory();
        let a = api("plugin-a", &[PluginPermission::Storage], host.clone());
        let b = api("plugin-b", &[PluginPermission::Storage], host.clone());

        a.storage().unwrap().set("count", json!(1)).await.unwrap();
        b.storage().unwrap().set("count", json!(2)).await.unwrap();

        assert_eq!(a.storage().unwrap().get("count").await.unwrap(), Some(json!(1)));
        assert_eq!(b.storage().unwrap().keys().await.unwrap(), vec!["count"]);
        assert_eq!(
            host.storage.get("plugin:plugin-a:count").await.unwrap(),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn test_workflow_methods_recheck() {
        let api = api("reader", &[PluginPermission::WorkflowsRead], HostApi::in_memory());
        let workflows = api.workflows().unwrap();

        assert!(workflows.list().await.unwrap().is_empty());
        let err = workflows.create(json!({"name": "x"})).await.unwrap_err();
        assert!(matches!(err, HostApiError::PermissionDenied(_)));
        assert!(matches!(
            workflows.get("missing").await.unwrap_err(),
            HostApiError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_commands_and_events_need_no_permission() {
        let host = HostApi::in_memory();
        let api = api("demo", &[], host.clone());

        let handle = api
            .commands()
            .register("demo.greet", |args: Value| async move { Ok(json!({"hello": args})) })
            .unwrap();
        let out = api.commands().execute("demo.greet", json!("you")).await.unwrap();
        assert_eq!(out, json!({"hello": "you"}));

        let sub = api.events().on("tick", |_| {});
        assert_eq!(api.events().emit("tick", &Value::Null), 1);

        handle.dispose().unwrap();
        sub.dispose().unwrap();
        assert!(!host.commands.contains("demo.greet"));
        assert_eq!(host.events.listener_count("tick"), 0);
    }

    #[tokio::test]
    async fn test_commands_are_isolated_per_plugin() {
        let host = HostApi::in_memory();
        let owner = api("owner", &[], host.clone());
        let intruder = api("intruder", &[], host.clone());

        let _secret = owner
            .commands()
            .register("owner.secret", |_| async { Ok(json!("owner-handler")) })
            .unwrap();

        // Neither a direct takeover nor a squat outside its own prefix
        let taken = intruder
            .commands()
            .register("owner.secret", |_| async { Ok(json!("intruder-handler")) })
            .unwrap_err();
        assert!(matches!(taken, HostApiError::Command(CommandError::OutsideNamespace { .. })));
        let bare = intruder.commands().register("secret", |_| async { Ok(Value::Null) }).unwrap_err();
        assert!(matches!(bare, HostApiError::Command(CommandError::OutsideNamespace { .. })));
        assert!(intruder.commands().register("intruder.", |_| async { Ok(Value::Null) }).is_err());

        let foreign = intruder.commands().execute("owner.secret", Value::Null).await.unwrap_err();
        assert!(matches!(foreign, HostApiError::Command(CommandError::Foreign { .. })));

        assert_eq!(host.commands.owner("owner.secret").as_deref(), Some("owner"));
        assert_eq!(
            owner.commands().execute("owner.secret", Value::Null).await.unwrap(),
            json!("owner-handler")
        );
        let host_side = host.commands.execute("owner.secret", Value::Null).await.unwrap().unwrap();
        assert_eq!(host_side, json!("owner-handler"));
    }

    #[tokio::test]
    async fn test_calls_are_monitored_and_suspended() {
        let monitor = ResourceMonitor::new(
            ResourceLimits {
                window: Duration::from_secs(60),
                max_calls: 1,
                max_wall_time: Duration::from_secs(60),
            },
            PermissionAuditor::null(),
        );
        let api = create_sandboxed_api(
            "busy",
            [PluginPermission::Storage].into_iter().collect(),
            HostApi::in_memory(),
            PermissionAuditor::null(),
            monitor.clone(),
        );
        let storage = api.storage().unwrap();

        storage.set("a", json!(1)).await.unwrap();
        storage.set("b", json!(2)).await.unwrap();
        assert!(monitor.is_flagged("busy"));
        assert!(matches!(
            storage.get("a").await.unwrap_err(),
            HostApiError::Suspended(_)
        ));
    }
}
