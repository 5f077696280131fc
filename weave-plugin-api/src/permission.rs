//! Plugin permission catalogue
//!
//! Every host capability a plugin can reach is named by a [`PluginPermission`].
//! The set is closed: manifests naming anything else fail validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A named, host-mediated capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PluginPermission {
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "storage")]
    Storage,
    #[serde(rename = "clipboard")]
    Clipboard,
    #[serde(rename = "env")]
    Env,
    #[serde(rename = "secrets")]
    Secrets,
    #[serde(rename = "filesystem")]
    Filesystem,
    #[serde(rename = "shell")]
    Shell,
    #[serde(rename = "workflows.read")]
    WorkflowsRead,
    #[serde(rename = "workflows.write")]
    WorkflowsWrite,
    #[serde(rename = "executions.run")]
    ExecutionsRun,
    #[serde(rename = "users.read")]
    UsersRead,
    #[serde(rename = "ui.notifications")]
    UiNotifications,
    #[serde(rename = "ui.sidebar")]
    UiSidebar,
    #[serde(rename = "ui.toolbar")]
    UiToolbar,
    #[serde(rename = "ui.panel")]
    UiPanel,
    #[serde(rename = "ui.modal")]
    UiModal,
}

/// How much damage a permission can do if abused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Safe,
    Sensitive,
    Dangerous,
}

/// Grouping used when presenting permissions to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    System,
    Data,
    Workflow,
    User,
    Ui,
}

/// Static description of a permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionMetadata {
    pub level: PermissionLevel,
    pub category: PermissionCategory,
    pub description: &'static str,
    pub requires_approval: bool,
}

impl PluginPermission {
    /// All known permissions, in declaration order
    pub const ALL: [PluginPermission; 16] = [
        Self::Network,
        Self::Storage,
        Self::Clipboard,
        Self::Env,
        Self::Secrets,
        Self::Filesystem,
        Self::Shell,
        Self::WorkflowsRead,
        Self::WorkflowsWrite,
        Self::ExecutionsRun,
        Self::UsersRead,
        Self::UiNotifications,
        Self::UiSidebar,
        Self::UiToolbar,
        Self::UiPanel,
        Self::UiModal,
    ];

    /// Wire name used in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Clipboard => "clipboard",
            Self::Env => "env",
            Self::Secrets => "secrets",
            Self::Filesystem => "filesystem",
            Self::Shell => "shell",
            Self::WorkflowsRead => "workflows.read",
            Self::WorkflowsWrite => "workflows.write",
            Self::ExecutionsRun => "executions.run",
            Self::UsersRead => "users.read",
            Self::UiNotifications => "ui.notifications",
            Self::UiSidebar => "ui.sidebar",
            Self::UiToolbar => "ui.toolbar",
            Self::UiPanel => "ui.panel",
            Self::UiModal => "ui.modal",
        }
    }

    pub fn metadata(&self) -> PermissionMetadata {
        use PermissionCategory as C;
        use PermissionLevel as L;

        let (level, category, description) = match self {
            Self::Network => (L::Dangerous, C::System, "Make HTTP requests to external services"),
            Self::Storage => (L::Safe, C::Data, "Store plugin data locally"),
            Self::Clipboard => (L::Sensitive, C::System, "Read from and write to the clipboard"),
            Self::Env => (L::Sensitive, C::System, "Read environment variables"),
            Self::Secrets => (L::Dangerous, C::Data, "Access stored credentials"),
            Self::Filesystem => (L::Dangerous, C::System, "Read and write files"),
            Self::Shell => (L::Dangerous, C::System, "Run shell commands"),
            Self::WorkflowsRead => (L::Sensitive, C::Workflow, "Read workflow definitions"),
            Self::WorkflowsWrite => (L::Dangerous, C::Workflow, "Create, modify and delete workflows"),
            Self::ExecutionsRun => (L::Sensitive, C::Workflow, "Start workflow executions"),
            Self::UsersRead => (L::Sensitive, C::User, "Read user profile information"),
            Self::UiNotifications => (L::Safe, C::Ui, "Show notifications"),
            Self::UiSidebar => (L::Safe, C::Ui, "Add sidebar panels"),
            Self::UiToolbar => (L::Safe, C::Ui, "Add toolbar buttons"),
            Self::UiPanel => (L::Safe, C::Ui, "Add panels"),
            Self::UiModal => (L::Safe, C::Ui, "Open modal dialogs"),
        };

        PermissionMetadata {
            level,
            category,
            description,
            requires_approval: level != L::Safe,
        }
    }

    pub fn is_dangerous(&self) -> bool {
        self.metadata().level == PermissionLevel::Dangerous
    }

    /// Match against a policy pattern such as `ui.*` or `storage`
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        match pattern.strip_suffix(".*") {
            Some(prefix) => self
                .as_str()
                .strip_prefix(prefix)
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false),
            None => pattern == "*" || pattern == self.as_str(),
        }
    }
}

impl fmt::Display for PluginPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a permission name is not in the catalogue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown permission: {0}")]
pub struct UnknownPermission(pub String);

impl FromStr for PluginPermission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

/// An ordered set of permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<PluginPermission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, permission: PluginPermission) -> bool {
        self.0.contains(&permission)
    }

    pub fn insert(&mut self, permission: PluginPermission) -> bool {
        self.0.insert(permission)
    }

    pub fn iter(&self) -> impl Iterator<Item = PluginPermission> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Permissions present in `self` but not in `other`
    pub fn difference(&self, other: &PermissionSet) -> Vec<PluginPermission> {
        self.0.difference(&other.0).copied().collect()
    }

    /// Stable content hash, used to detect escalation between versions
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for permission in &self.0 {
            hasher.update(permission.as_str().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl FromIterator<PluginPermission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = PluginPermission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PermissionSet {
    type Item = &'a PluginPermission;
    type IntoIter = std::collections::btree_set::Iter<'a, PluginPermission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for permission in PluginPermission::ALL {
            let parsed: PluginPermission = permission.as_str().parse().unwrap();
            assert_eq!(parsed, permission);
            let json = serde_json::to_string(&permission).unwrap();
            assert_eq!(json, format!("\"{}\"", permission.as_str()));
        }
    }

    #[test]
    fn test_unknown_permission() {
        let err = "teleport".parse::<PluginPermission>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown permission: teleport");
    }

    #[test]
    fn test_dangerous_permissions() {
        assert!(PluginPermission::Network.is_dangerous());
        assert!(PluginPermission::WorkflowsWrite.is_dangerous());
        assert!(!PluginPermission::Storage.is_dangerous());
        assert!(!PluginPermission::Storage.metadata().requires_approval);
        assert!(PluginPermission::WorkflowsRead.metadata().requires_approval);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(PluginPermission::UiModal.matches_pattern("ui.*"));
        assert!(!PluginPermission::UsersRead.matches_pattern("ui.*"));
        assert!(PluginPermission::Storage.matches_pattern("storage"));
        assert!(PluginPermission::Shell.matches_pattern("*"));
        assert!(!PluginPermission::WorkflowsRead.matches_pattern("workflows"));
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a: PermissionSet = [PluginPermission::Storage, PluginPermission::Network]
            .into_iter()
            .collect();
        let b: PermissionSet = [PluginPermission::Network, PluginPermission::Storage]
            .into_iter()
            .collect();
        assert_eq!(a.compute_hash(), b.compute_hash());

        let c: PermissionSet = [PluginPermission::Storage].into_iter().collect();
        assert_ne!(a.compute_hash(), c.compute_hash());
        assert_eq!(a.difference(&c), vec![PluginPermission::Network]);
    }
}
