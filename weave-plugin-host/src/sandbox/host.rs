//! Host capability backends
//!
//! These traits are what the embedding application implements. Plugins never
//! see them directly: they reach them through the permission-checked facets
//! of [`super::PluginApi`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use weave_plugin_sdk::BoxFuture;

use crate::disposable::Disposable;

/// Failure reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), BackendError>;
    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub active: bool,
}

#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    async fn list(&self) -> Result<Vec<WorkflowSummary>, BackendError>;
    async fn get(&self, id: &str) -> Result<Option<Value>, BackendError>;
    /// Returns the new workflow id
    async fn create(&self, workflow: Value) -> Result<String, BackendError>;
    async fn update(&self, id: &str, workflow: Value) -> Result<(), BackendError>;
    async fn delete(&self, id: &str) -> Result<bool, BackendError>;
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start a run and return its execution id
    async fn run(&self, workflow_id: &str, input: Value) -> Result<String, BackendError>;
    async fn status(&self, execution_id: &str) -> Result<Option<Value>, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Filled in by the sandbox
    pub plugin_id: String,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
}

#[async_trait]
pub trait NotificationBackend: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), BackendError>;
}

/// Secrets are scoped to the requesting plugin
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    async fn get(&self, plugin_id: &str, name: &str) -> Result<Option<String>, BackendError>;
}

#[async_trait]
pub trait EnvBackend: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>, BackendError>;
}

#[async_trait]
pub trait ClipboardBackend: Send + Sync {
    async fn read(&self) -> Result<Option<String>, BackendError>;
    async fn write(&self, text: String) -> Result<(), BackendError>;
}

// ============================================================================
// Commands
// ============================================================================

pub type CommandHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BackendError>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Command '{id}' is already registered by plugin '{owner}'")]
    Taken { id: String, owner: String },

    #[error("Command '{id}' must be prefixed with '{plugin_id}.'")]
    OutsideNamespace { id: String, plugin_id: String },

    #[error("Plugin '{plugin_id}' may not run command '{id}' owned by '{owner}'")]
    Foreign { id: String, plugin_id: String, owner: String },
}

struct CommandEntry {
    token: u64,
    owner: String,
    handler: CommandHandler,
}

/// Host-wide command table
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: Arc<RwLock<HashMap<String, CommandEntry>>>,
    next_token: Arc<AtomicU64>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id` for `owner`
    ///
    /// An owner may replace its own registration; an id held by another
    /// owner is refused. Disposing the returned handle removes this
    /// registration only.
    pub fn register(
        &self,
        owner: &str,
        id: impl Into<String>,
        handler: CommandHandler,
    ) -> Result<Disposable, CommandError> {
        let id = id.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = self.commands.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = map.get(&id).filter(|entry| entry.owner != owner) {
                return Err(CommandError::Taken {
                    id,
                    owner: existing.owner.clone(),
                });
            }
            map.insert(
                id.clone(),
                CommandEntry {
                    token,
                    owner: owner.to_string(),
                    handler,
                },
            );
        }

        let commands = self.commands.clone();
        Ok(Disposable::new(format!("command:{}", id), move || {
            let mut map = commands.write().unwrap_or_else(|e| e.into_inner());
            if map.get(&id).is_some_and(|entry| entry.token == token) {
                map.remove(&id);
            }
            Ok(())
        }))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.commands.read().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    /// Plugin that registered `id`
    pub fn owner(&self, id: &str) -> Option<String> {
        self.commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.owner.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Run a command; `None` if nothing is registered under `id`
    pub async fn execute(&self, id: &str, args: Value) -> Option<Result<Value, BackendError>> {
        let handler = self
            .commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.handler.clone())?;
        Some(handler(args).await)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.ids())
            .finish()
    }
}

// ============================================================================
// Events
// ============================================================================

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Synchronous in-process event bus
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<String, Vec<(u64, EventHandler)>>>>,
    next_token: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: impl Into<String>, handler: EventHandler) -> Disposable {
        let event = event.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.clone())
            .or_default()
            .push((token, handler));

        let handlers = self.handlers.clone();
        Disposable::new(format!("event:{}", event), move || {
            let mut map = handlers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = map.get_mut(&event) {
                list.retain(|(t, _)| *t != token);
                if list.is_empty() {
                    map.remove(&event);
                }
            }
            Ok(())
        })
    }

    /// Call every handler for `event` in registration order; returns how many ran
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        // Handlers run without the lock so they may subscribe or dispose
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("EventBus")
            .field("events", &map.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Host API bundle
// ============================================================================

/// Every backend the host offers, shared by all plugins
#[derive(Clone)]
pub struct HostApi {
    pub storage: Arc<dyn StorageBackend>,
    pub http: Arc<dyn HttpBackend>,
    pub workflows: Arc<dyn WorkflowBackend>,
    pub executions: Arc<dyn ExecutionBackend>,
    pub notifications: Arc<dyn NotificationBackend>,
    pub secrets: Arc<dyn SecretsBackend>,
    pub env: Arc<dyn EnvBackend>,
    pub clipboard: Arc<dyn ClipboardBackend>,
    pub commands: CommandRegistry,
    pub events: EventBus,
}

impl HostApi {
    /// In-process backends with no external effects
    pub fn in_memory() -> Self {
        use super::backends::*;

        Self {
            storage: Arc::new(MemoryStorage::new()),
            http: Arc::new(StaticHttp::new()),
            workflows: Arc::new(MemoryWorkflows::new()),
            executions: Arc::new(MemoryExecutions::new()),
            notifications: Arc::new(CollectingNotifications::new()),
            secrets: Arc::new(MemorySecrets::new()),
            env: Arc::new(MemoryEnv::new()),
            clipboard: Arc::new(MemoryClipboard::new()),
            commands: CommandRegistry::new(),
            events: EventBus::new(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpBackend>) -> Self {
        self.http = http;
        self
    }

    pub fn with_workflows(mut self, workflows: Arc<dyn WorkflowBackend>) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn with_executions(mut self, executions: Arc<dyn ExecutionBackend>) -> Self {
        self.executions = executions;
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationBackend>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretsBackend>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_env(mut self, env: Arc<dyn EnvBackend>) -> Self {
        self.env = env;
        self
    }

    pub fn with_clipboard(mut self, clipboard: Arc<dyn ClipboardBackend>) -> Self {
        self.clipboard = clipboard;
        self
    }
}

impl Default for HostApi {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApi")
            .field("commands", &self.commands)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn echo() -> CommandHandler {
        Arc::new(|args: Value| -> BoxFuture<'static, Result<Value, BackendError>> {
            Box::pin(async move { Ok(args) })
        })
    }

    #[tokio::test]
    async fn test_command_register_execute_dispose() {
        let commands = CommandRegistry::new();
        let handle = commands.register("demo", "demo.echo", echo()).unwrap();

        assert_eq!(commands.owner("demo.echo").as_deref(), Some("demo"));
        let result = commands.execute("demo.echo", json!({"x": 1})).await.unwrap().unwrap();
        assert_eq!(result, json!({"x": 1}));

        handle.dispose().unwrap();
        assert!(!commands.contains("demo.echo"));
        assert!(commands.execute("demo.echo", Value::Null).await.is_none());
    }

    #[test]
    fn test_stale_dispose_keeps_replacement() {
        let commands = CommandRegistry::new();
        let old = commands.register("a", "a.shared", echo()).unwrap();
        let _new = commands.register("a", "a.shared", echo()).unwrap();

        old.dispose().unwrap();
        assert_eq!(commands.owner("a.shared").as_deref(), Some("a"));
        assert!(commands.contains("a.shared"));
    }

    #[tokio::test]
    async fn test_foreign_owner_cannot_replace() {
        let commands = CommandRegistry::new();
        let _owned = commands.register("owner", "owner.secret", echo()).unwrap();

        let err = commands.register("intruder", "owner.secret", echo()).unwrap_err();
        assert_eq!(
            err,
            CommandError::Taken {
                id: "owner.secret".into(),
                owner: "owner".into()
            }
        );
        assert_eq!(commands.owner("owner.secret").as_deref(), Some("owner"));
        let out = commands.execute("owner.secret", json!("kept")).await.unwrap().unwrap();
        assert_eq!(out, json!("kept"));
    }

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let first = bus.on("saved", Arc::new(move |v: &Value| s.lock().unwrap().push(v.clone())));
        let s = seen.clone();
        let _second = bus.on("saved", Arc::new(move |_: &Value| s.lock().unwrap().push(json!("second"))));

        assert_eq!(bus.emit("saved", &json!(1)), 2);
        first.dispose().unwrap();
        assert_eq!(bus.emit("saved", &json!(2)), 1);
        assert_eq!(bus.emit("other", &json!(3)), 0);

        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!("second"), json!("second")]);
    }
}
