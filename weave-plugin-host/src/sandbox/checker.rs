//! Runtime permission checks

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use weave_plugin_api::{PermissionSet, PluginPermission};

use crate::audit::PermissionAuditor;

/// A plugin touched a capability it was not granted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Plugin '{plugin_id}' does not have permission '{permission}'")]
pub struct PermissionDeniedError {
    pub plugin_id: String,
    pub permission: PluginPermission,
}

/// The permissions a plugin ended up with after policy and confirmation
///
/// Immutable once built; cloning shares the same set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantedPermissions(Arc<PermissionSet>);

impl GrantedPermissions {
    pub fn new(set: PermissionSet) -> Self {
        Self(Arc::new(set))
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn contains(&self, permission: PluginPermission) -> bool {
        self.0.contains(permission)
    }

    pub fn iter(&self) -> impl Iterator<Item = PluginPermission> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_set(&self) -> &PermissionSet {
        &self.0
    }

    pub fn compute_hash(&self) -> String {
        self.0.compute_hash()
    }
}

impl FromIterator<PluginPermission> for GrantedPermissions {
    fn from_iter<I: IntoIterator<Item = PluginPermission>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Checks capabilities for one plugin and audits every decision
#[derive(Clone)]
pub struct PermissionChecker {
    plugin_id: Arc<str>,
    granted: GrantedPermissions,
    auditor: PermissionAuditor,
}

impl PermissionChecker {
    pub fn new(plugin_id: impl Into<Arc<str>>, granted: GrantedPermissions, auditor: PermissionAuditor) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            granted,
            auditor,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn granted(&self) -> &GrantedPermissions {
        &self.granted
    }

    /// Introspection only; nothing is audited
    pub fn has(&self, permission: PluginPermission) -> bool {
        self.granted.contains(permission)
    }

    pub fn check(&self, permission: PluginPermission) -> Result<(), PermissionDeniedError> {
        let allowed = self.granted.contains(permission);
        tracing::debug!(
            plugin = %self.plugin_id,
            permission = %permission,
            allowed,
            "Permission check"
        );
        self.auditor.check(&self.plugin_id, permission, allowed);

        if allowed {
            Ok(())
        } else {
            Err(PermissionDeniedError {
                plugin_id: self.plugin_id.to_string(),
                permission,
            })
        }
    }

    /// Succeeds if any of `permissions` is granted
    pub fn check_any(&self, permissions: &[PluginPermission]) -> Result<(), PermissionDeniedError> {
        match permissions.iter().find(|p| self.granted.contains(**p)) {
            Some(p) => self.check(*p),
            None => match permissions.first() {
                Some(p) => self.check(*p),
                None => Ok(()),
            },
        }
    }
}

impl fmt::Debug for PermissionChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionChecker")
            .field("plugin_id", &self.plugin_id)
            .field("granted", &self.granted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditSink};

    #[test]
    fn test_check_audits_both_outcomes() {
        let sink = Arc::new(MemoryAuditSink::new());
        let checker = PermissionChecker::new(
            "demo",
            [PluginPermission::Storage].into_iter().collect(),
            PermissionAuditor::new(sink.clone()),
        );

        assert!(checker.check(PluginPermission::Storage).is_ok());
        let err = checker.check(PluginPermission::Network).unwrap_err();
        assert_eq!(err.permission, PluginPermission::Network);
        assert_eq!(err.plugin_id, "demo");

        assert_eq!(sink.find_by_action(AuditAction::Check).len(), 1);
        assert_eq!(sink.find_by_action(AuditAction::Denied).len(), 1);
    }

    #[test]
    fn test_has_is_silent() {
        let sink = Arc::new(MemoryAuditSink::new());
        let checker = PermissionChecker::new("demo", GrantedPermissions::none(), PermissionAuditor::new(sink.clone()));
        assert!(!checker.has(PluginPermission::Storage));
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_check_any() {
        let checker = PermissionChecker::new(
            "demo",
            [PluginPermission::WorkflowsWrite].into_iter().collect(),
            PermissionAuditor::null(),
        );
        assert!(checker
            .check_any(&[PluginPermission::WorkflowsRead, PluginPermission::WorkflowsWrite])
            .is_ok());
        assert!(checker.check_any(&[PluginPermission::Secrets]).is_err());
    }
}
