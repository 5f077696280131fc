//! Plugin manifest model and structural validation
//!
//! `manifest.json` is parsed in two passes: [`validate_manifest`] walks the raw
//! JSON and collects every problem it can find, then [`PluginManifest::from_json`]
//! deserialises into typed structures once the report is clean.

use crate::permission::{PermissionSet, PluginPermission};
use crate::version::parse_version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Descriptions shorter than this produce a warning
pub const MIN_DESCRIPTION_LENGTH: usize = 20;

/// Check an identifier against the plugin/node id pattern `^[a-z0-9-]+$`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Category shared by plugins and the nodes they contribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Trigger,
    Action,
    Logic,
    Data,
    Ai,
    Integration,
    Custom,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Self::Trigger,
        Self::Action,
        Self::Logic,
        Self::Data,
        Self::Ai,
        Self::Integration,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Logic => "logic",
            Self::Data => "data",
            Self::Ai => "ai",
            Self::Integration => "integration",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown category: {}", s))
    }
}

/// A command contributed to the host's command palette
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContribution {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A menu entry bound to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuContribution {
    pub location: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeybindingContribution {
    pub command: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewContribution {
    pub id: String,
    pub name: String,
    pub location: String,
}

/// Everything a plugin adds to the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contributions {
    /// Node descriptors, validated by the SDK at load time
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default)]
    pub commands: Vec<CommandContribution>,
    #[serde(default)]
    pub menus: Vec<MenuContribution>,
    #[serde(default)]
    pub keybindings: Vec<KeybindingContribution>,
    #[serde(default)]
    pub views: Vec<ViewContribution>,
}

impl Contributions {
    /// Ids of contributed nodes (descriptors without a string id are skipped)
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter_map(|n| n.get("id").and_then(Value::as_str))
    }
}

/// Dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    pub id: String,
    /// Version range, e.g. `^1.2.0`
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

/// Static descriptor of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category: Category,
    #[serde(default)]
    pub permissions: PermissionSet,
    #[serde(default)]
    pub contributes: Contributions,
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    #[serde(default)]
    pub activation_events: Vec<String>,
    /// Module entry point resolved by the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_app_version: Option<String>,
}

/// Error from [`PluginManifest::from_json`]
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Manifest validation failed with {} error(s)", .0.errors.len())]
    Invalid(ManifestReport),
}

impl PluginManifest {
    /// Parse and validate a manifest document
    pub fn from_json(input: &str) -> Result<Self, ManifestError> {
        let raw: Value = serde_json::from_str(input)?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self, ManifestError> {
        let report = validate_manifest(&raw);
        if !report.valid {
            return Err(ManifestError::Invalid(report));
        }
        Ok(serde_json::from_value(raw)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn has_permission(&self, permission: PluginPermission) -> bool {
        self.permissions.contains(permission)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// A blocking manifest problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestIssue {
    pub field: String,
    pub code: &'static str,
    pub message: String,
}

/// Result of [`validate_manifest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestReport {
    pub valid: bool,
    pub errors: Vec<ManifestIssue>,
    pub warnings: Vec<ManifestIssue>,
}

struct ReportBuilder {
    errors: Vec<ManifestIssue>,
    warnings: Vec<ManifestIssue>,
}

impl ReportBuilder {
    fn error(&mut self, field: impl Into<String>, code: &'static str, message: impl Into<String>) {
        self.errors.push(ManifestIssue {
            field: field.into(),
            code,
            message: message.into(),
        });
    }

    fn warn(&mut self, field: impl Into<String>, code: &'static str, message: impl Into<String>) {
        self.warnings.push(ManifestIssue {
            field: field.into(),
            code,
            message: message.into(),
        });
    }

    fn finish(self) -> ManifestReport {
        ManifestReport {
            valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

fn required_string<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &str,
    report: &mut ReportBuilder,
) -> Option<&'a str> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            report.error(field, "REQUIRED", format!("{} is required", field));
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            report.error(field, "REQUIRED", format!("{} must not be empty", field));
            None
        }
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            report.error(field, "INVALID_TYPE", format!("{} must be a string", field));
            None
        }
    }
}

/// Validate a raw manifest document
///
/// Errors block installation; warnings are advisory.
pub fn validate_manifest(manifest: &Value) -> ManifestReport {
    let mut report = ReportBuilder {
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let Some(obj) = manifest.as_object() else {
        report.error("", "INVALID_TYPE", "Manifest must be a JSON object");
        return report.finish();
    };

    if let Some(id) = required_string(obj, "id", &mut report) {
        if !is_valid_id(id) {
            report.error(
                "id",
                "INVALID_ID",
                "id may only contain lowercase letters, digits and hyphens",
            );
        }
    }

    required_string(obj, "name", &mut report);

    if let Some(version) = required_string(obj, "version", &mut report) {
        if let Err(e) = parse_version(version) {
            report.error("version", "INVALID_VERSION", e.to_string());
        }
    }

    if let Some(category) = required_string(obj, "category", &mut report) {
        if category.parse::<Category>().is_err() {
            report.error(
                "category",
                "INVALID_CATEGORY",
                format!("Unknown category: {}", category),
            );
        }
    }

    validate_permissions(obj.get("permissions"), &mut report);
    validate_dependencies(obj.get("dependencies"), &mut report);

    for field in ["minAppVersion", "maxAppVersion"] {
        match obj.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(v)) => {
                if let Err(e) = parse_version(v) {
                    report.error(field, "INVALID_VERSION", e.to_string());
                }
            }
            Some(_) => report.error(field, "INVALID_TYPE", format!("{} must be a string", field)),
        }
    }

    if let Some(contributes) = obj.get("contributes") {
        if !contributes.is_object() {
            report.error("contributes", "INVALID_TYPE", "contributes must be an object");
        }
    }

    match obj.get("author") {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        _ => report.warn("author", "MISSING_AUTHOR", "Consider adding an author"),
    }

    match obj.get("tags") {
        Some(Value::Array(tags)) if !tags.is_empty() => {}
        _ => report.warn("tags", "MISSING_TAGS", "Tags make the plugin easier to discover"),
    }

    let description_len = obj
        .get("description")
        .and_then(Value::as_str)
        .map(|d| d.trim().chars().count())
        .unwrap_or(0);
    if description_len < MIN_DESCRIPTION_LENGTH {
        report.warn(
            "description",
            "SHORT_DESCRIPTION",
            format!(
                "Description should be at least {} characters",
                MIN_DESCRIPTION_LENGTH
            ),
        );
    }

    report.finish()
}

fn validate_permissions(value: Option<&Value>, report: &mut ReportBuilder) {
    let entries = match value {
        None | Some(Value::Null) => return,
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            report.error("permissions", "INVALID_TYPE", "permissions must be an array");
            return;
        }
    };

    for (i, entry) in entries.iter().enumerate() {
        let field = format!("permissions[{}]", i);
        let Some(name) = entry.as_str() else {
            report.error(field, "INVALID_TYPE", "permission must be a string");
            continue;
        };
        match name.parse::<PluginPermission>() {
            Ok(permission) if permission.is_dangerous() => report.warn(
                field,
                "DANGEROUS_PERMISSION",
                format!("{} requires explicit user confirmation", permission),
            ),
            Ok(_) => {}
            Err(e) => report.error(field, "UNKNOWN_PERMISSION", e.to_string()),
        }
    }
}

fn validate_dependencies(value: Option<&Value>, report: &mut ReportBuilder) {
    let entries = match value {
        None | Some(Value::Null) => return,
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            report.error("dependencies", "INVALID_TYPE", "dependencies must be an array");
            return;
        }
    };

    for (i, entry) in entries.iter().enumerate() {
        let id = entry.get("id").and_then(Value::as_str);
        let range = entry.get("version").and_then(Value::as_str);
        if id.is_none() || range.is_none() {
            report.error(
                format!("dependencies[{}]", i),
                "INVALID_DEPENDENCY",
                "dependency requires string id and version",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codes(issues: &[ManifestIssue]) -> Vec<&'static str> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_minimal_manifest_is_valid_with_warnings() {
        let report = validate_manifest(&json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "category": "custom",
        }));
        assert!(report.valid);
        assert_eq!(
            codes(&report.warnings),
            vec!["MISSING_AUTHOR", "MISSING_TAGS", "SHORT_DESCRIPTION"]
        );
    }

    #[test]
    fn test_missing_required_fields() {
        let report = validate_manifest(&json!({ "name": "Demo" }));
        assert!(!report.valid);
        let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "version", "category"]);
        assert!(report.errors.iter().all(|e| e.code == "REQUIRED"));
    }

    #[test]
    fn test_unknown_permissions_reported_per_entry() {
        let report = validate_manifest(&json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "category": "data",
            "permissions": ["storage", "teleport", "mind-reading", "network"],
        }));
        assert!(!report.valid);
        assert_eq!(codes(&report.errors), vec!["UNKNOWN_PERMISSION", "UNKNOWN_PERMISSION"]);
        assert_eq!(report.errors[0].field, "permissions[1]");
        assert!(codes(&report.warnings).contains(&"DANGEROUS_PERMISSION"));
    }

    #[test]
    fn test_invalid_id_and_version() {
        let report = validate_manifest(&json!({
            "id": "My_Plugin",
            "name": "Demo",
            "version": "1.0",
            "category": "robots",
        }));
        assert_eq!(
            codes(&report.errors),
            vec!["INVALID_ID", "INVALID_VERSION", "INVALID_CATEGORY"]
        );
    }

    #[test]
    fn test_from_json_round_trip() {
        let manifest = PluginManifest::from_json(
            r#"{
                "id": "demo",
                "name": "Demo",
                "version": "1.0.0",
                "category": "integration",
                "author": "Weave",
                "permissions": ["storage"],
                "activationEvents": ["onStartup"],
                "main": "demo",
                "contributes": {
                    "nodes": [{ "id": "demo-node" }],
                    "commands": [{ "id": "demo.hello", "title": "Hello" }]
                }
            }"#,
        )
        .unwrap();

        assert!(manifest.has_permission(PluginPermission::Storage));
        assert!(!manifest.has_permission(PluginPermission::Network));
        assert_eq!(manifest.activation_events, vec!["onStartup"]);
        assert_eq!(manifest.contributes.node_ids().collect::<Vec<_>>(), vec!["demo-node"]);

        let again = PluginManifest::from_json(&manifest.to_json_pretty().unwrap()).unwrap();
        assert_eq!(again, manifest);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = PluginManifest::from_json(r#"{"id": "x"}"#).unwrap_err();
        match err {
            ManifestError::Invalid(report) => assert!(!report.errors.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
