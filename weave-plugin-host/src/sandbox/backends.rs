//! In-memory backends
//!
//! Used by [`super::HostApi::in_memory`] for tests, the CLI and embedding
//! hosts that have not wired real services yet.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::host::{
    BackendError, ClipboardBackend, EnvBackend, ExecutionBackend, HttpBackend, HttpRequest,
    HttpResponse, Notification, NotificationBackend, SecretsBackend, StorageBackend,
    WorkflowBackend, WorkflowSummary,
};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        Ok(self.data.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), BackendError> {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self
            .data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Answers from a fixed table of `METHOD url` routes; anything else is a 404
#[derive(Debug, Default)]
pub struct StaticHttp {
    routes: RwLock<HashMap<String, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl StaticHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, method: &str, url: &str, response: HttpResponse) -> Self {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(format!("{} {}", method.to_uppercase(), url), response);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HttpBackend for StaticHttp {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, BackendError> {
        let key = format!("{} {}", request.method.to_uppercase(), request.url);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        Ok(routes.get(&key).cloned().unwrap_or_else(|| HttpResponse {
            status: 404,
            headers: BTreeMap::new(),
            body: json!({"error": "not found"}),
        }))
    }
}

#[derive(Debug, Default)]
pub struct MemoryWorkflows {
    workflows: RwLock<BTreeMap<String, Value>>,
    next_id: AtomicU64,
}

impl MemoryWorkflows {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowBackend for MemoryWorkflows {
    async fn list(&self) -> Result<Vec<WorkflowSummary>, BackendError> {
        let workflows = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        Ok(workflows
            .iter()
            .map(|(id, wf)| WorkflowSummary {
                id: id.clone(),
                name: wf.get("name").and_then(Value::as_str).unwrap_or(id.as_str()).to_string(),
                active: wf.get("active").and_then(Value::as_bool).unwrap_or(false),
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, BackendError> {
        Ok(self.workflows.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned())
    }

    async fn create(&self, workflow: Value) -> Result<String, BackendError> {
        let id = format!("wf-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), workflow);
        Ok(id)
    }

    async fn update(&self, id: &str, workflow: Value) -> Result<(), BackendError> {
        let mut workflows = self.workflows.write().unwrap_or_else(|e| e.into_inner());
        match workflows.get_mut(id) {
            Some(existing) => {
                *existing = workflow;
                Ok(())
            }
            None => Err(BackendError::new(format!("Workflow '{}' not found", id))),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, BackendError> {
        Ok(self
            .workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some())
    }
}

/// Records runs and reports them as immediately finished
#[derive(Debug, Default)]
pub struct MemoryExecutions {
    runs: RwLock<HashMap<String, Value>>,
    next_id: AtomicU64,
}

impl MemoryExecutions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionBackend for MemoryExecutions {
    async fn run(&self, workflow_id: &str, input: Value) -> Result<String, BackendError> {
        let id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let status = json!({
            "id": id,
            "workflowId": workflow_id,
            "status": "success",
            "input": input,
        });
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), status);
        Ok(id)
    }

    async fn status(&self, execution_id: &str) -> Result<Option<Value>, BackendError> {
        Ok(self
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(execution_id)
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct CollectingNotifications {
    sent: Mutex<Vec<Notification>>,
}

impl CollectingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationBackend for CollectingNotifications {
    async fn notify(&self, notification: Notification) -> Result<(), BackendError> {
        tracing::info!(
            plugin = %notification.plugin_id,
            level = ?notification.level,
            title = %notification.title,
            "Plugin notification"
        );
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
        Ok(())
    }
}

/// Secrets keyed by `(plugin_id, name)`
#[derive(Debug, Default)]
pub struct MemorySecrets {
    secrets: RwLock<HashMap<(String, String), String>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plugin_id: &str, name: &str, value: impl Into<String>) {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((plugin_id.to_string(), name.to_string()), value.into());
    }
}

#[async_trait]
impl SecretsBackend for MemorySecrets {
    async fn get(&self, plugin_id: &str, name: &str) -> Result<Option<String>, BackendError> {
        Ok(self
            .secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(plugin_id.to_string(), name.to_string()))
            .cloned())
    }
}

/// A fixed environment; the process environment is never exposed
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: HashMap<String, String>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl EnvBackend for MemoryEnv {
    async fn get(&self, name: &str) -> Result<Option<String>, BackendError> {
        Ok(self.vars.get(name).cloned())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryClipboard {
    text: Arc<Mutex<Option<String>>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClipboardBackend for MemoryClipboard {
    async fn read(&self) -> Result<Option<String>, BackendError> {
        Ok(self.text.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn write(&self, text: String) -> Result<(), BackendError> {
        *self.text.lock().unwrap_or_else(|e| e.into_inner()) = Some(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_prefix_keys() {
        let storage = MemoryStorage::new();
        storage.set("a:1", json!(1)).await.unwrap();
        storage.set("a:2", json!(2)).await.unwrap();
        storage.set("b:1", json!(3)).await.unwrap();

        assert_eq!(storage.keys("a:").await.unwrap(), vec!["a:1", "a:2"]);
        assert!(storage.delete("a:1").await.unwrap());
        assert!(!storage.delete("a:1").await.unwrap());
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn test_static_http_routes() {
        let http = StaticHttp::new().route(
            "get",
            "https://api.example.com/ping",
            HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: json!("pong"),
            },
        );

        let ok = http.request(HttpRequest::get("https://api.example.com/ping")).await.unwrap();
        assert_eq!(ok.body, json!("pong"));
        let missing = http.request(HttpRequest::get("https://api.example.com/nope")).await.unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_workflows() {
        let workflows = MemoryWorkflows::new();
        let id = workflows.create(json!({"name": "Nightly", "active": true})).await.unwrap();

        let list = workflows.list().await.unwrap();
        assert_eq!(list[0].name, "Nightly");
        assert!(list[0].active);

        assert!(workflows.update("missing", json!({})).await.is_err());
        assert!(workflows.delete(&id).await.unwrap());
    }
}
