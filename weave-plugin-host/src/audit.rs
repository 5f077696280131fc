//! Audit system for tracking permission events
//!
//! Every grant, revoke, permission check, denial, resource-limit trip and
//! lifecycle transition is recorded as an [`AuditEntry`] through an
//! [`AuditSink`]. Hosts pick the destination by choosing a sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use weave_plugin_api::PluginPermission;

/// Default capacity of [`MemoryAuditSink`]
pub const DEFAULT_MEMORY_CAPACITY: usize = 1000;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Grant,
    Revoke,
    Check,
    Denied,
    ResourceLimitExceeded,
    Lifecycle,
    Escalation,
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub plugin_id: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PluginPermission>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(plugin_id: impl Into<String>, action: AuditAction, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin_id: plugin_id.into(),
            action,
            permission: None,
            success,
            actor: None,
            reason: None,
        }
    }

    pub fn with_permission(mut self, permission: PluginPermission) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize audit entry: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Audit sink not available: {0}")]
    Unavailable(String),
}

/// Destination for audit entries
///
/// # Example
///
/// ```rust
/// use weave_plugin_host::audit::{AuditEntry, AuditError, AuditSink};
///
/// struct StderrSink;
///
/// impl AuditSink for StderrSink {
///     fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
///         eprintln!("{:?} {}", entry.action, entry.plugin_id);
///         Ok(())
///     }
///
///     fn flush(&self) -> Result<(), AuditError> {
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    /// Record an audit entry
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;

    /// Flush any buffered entries
    fn flush(&self) -> Result<(), AuditError>;

    /// Check if the sink is healthy/available
    fn is_healthy(&self) -> bool {
        true
    }
}

// ============================================================================
// Default Implementations
// ============================================================================

/// File-based audit sink (JSONL format)
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let json = serde_json::to_string(&entry)?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.flush()?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.path.parent().map(|p| p.exists()).unwrap_or(true)
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory audit sink with FIFO eviction
pub struct MemoryAuditSink {
    entries: RwLock<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(DEFAULT_MEMORY_CAPACITY))),
            max_entries,
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.read().iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn find_by_action(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.read()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    pub fn find_by_plugin(&self, plugin_id: &str) -> Vec<AuditEntry> {
        self.read()
            .iter()
            .filter(|e| e.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<AuditEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("count", &self.count())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

/// Null audit sink (discards all entries)
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl NullAuditSink {
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for NullAuditSink {
    fn record(&self, _entry: AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Composite audit sink that writes to multiple sinks
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl AuditSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Add a sink that the caller keeps a handle to
    pub fn with_shared(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for CompositeAuditSink {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        for sink in &self.sinks {
            sink.record(entry.clone())?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        for sink in &self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.sinks.iter().all(|s| s.is_healthy())
    }
}

impl fmt::Debug for CompositeAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeAuditSink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

// ============================================================================
// Auditor
// ============================================================================

/// Cheap, clone-able front end over a sink
///
/// Recording never fails for the caller: sink errors are logged and dropped.
#[derive(Clone)]
pub struct PermissionAuditor {
    sink: Arc<dyn AuditSink>,
}

impl PermissionAuditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Auditor that discards everything
    pub fn null() -> Self {
        Self::new(Arc::new(NullAuditSink))
    }

    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.sink.record(entry) {
            tracing::warn!(error = %e, "Failed to record audit entry");
        }
    }

    pub fn grant(&self, plugin_id: &str, permission: PluginPermission, actor: &str) {
        self.record(
            AuditEntry::new(plugin_id, AuditAction::Grant, true)
                .with_permission(permission)
                .with_actor(actor),
        );
    }

    pub fn revoke(&self, plugin_id: &str, permission: PluginPermission, reason: &str) {
        self.record(
            AuditEntry::new(plugin_id, AuditAction::Revoke, true)
                .with_permission(permission)
                .with_reason(reason),
        );
    }

    pub fn check(&self, plugin_id: &str, permission: PluginPermission, allowed: bool) {
        let action = if allowed {
            AuditAction::Check
        } else {
            AuditAction::Denied
        };
        self.record(AuditEntry::new(plugin_id, action, allowed).with_permission(permission));
    }

    pub fn denied(&self, plugin_id: &str, permission: PluginPermission, reason: &str) {
        self.record(
            AuditEntry::new(plugin_id, AuditAction::Denied, false)
                .with_permission(permission)
                .with_reason(reason),
        );
    }

    pub fn resource_limit(&self, plugin_id: &str, reason: &str) {
        self.record(AuditEntry::new(plugin_id, AuditAction::ResourceLimitExceeded, false).with_reason(reason));
    }

    pub fn lifecycle(&self, plugin_id: &str, event: &str, success: bool) {
        self.record(AuditEntry::new(plugin_id, AuditAction::Lifecycle, success).with_reason(event));
    }

    pub fn escalation(&self, plugin_id: &str, old_hash: &str, new_hash: &str) {
        self.record(
            AuditEntry::new(plugin_id, AuditAction::Escalation, true)
                .with_reason(format!("permission hash changed: {} -> {}", old_hash, new_hash)),
        );
    }

    pub fn flush(&self) {
        if let Err(e) = self.sink.flush() {
            tracing::warn!(error = %e, "Failed to flush audit sink");
        }
    }
}

impl fmt::Debug for PermissionAuditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionAuditor")
            .field("healthy", &self.sink.is_healthy())
            .finish()
    }
}
