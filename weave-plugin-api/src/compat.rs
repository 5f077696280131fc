//! Install-time and upgrade-time compatibility checks over whole manifests

use crate::manifest::PluginManifest;
use crate::version::{
    compare_versions, satisfies_range, upgrade_issues, CompatibilityIssue, CompatibilityResult,
    IssueKind, Severity,
};
use std::cmp::Ordering;

/// Check a manifest against the running app and the plugins already installed
pub fn check_compatibility(
    manifest: &PluginManifest,
    app_version: &str,
    installed: &[PluginManifest],
) -> CompatibilityResult {
    let mut issues = Vec::new();

    if let Some(min) = &manifest.min_app_version {
        if matches!(compare_versions(app_version, min), Ok(Ordering::Less)) {
            issues.push(
                CompatibilityIssue::new(
                    IssueKind::AppVersion,
                    Severity::Error,
                    format!("Requires app version {} or newer", min),
                )
                .with_details(format!("Current version: {}", app_version)),
            );
        }
    }

    if let Some(max) = &manifest.max_app_version {
        if matches!(compare_versions(app_version, max), Ok(Ordering::Greater)) {
            issues.push(
                CompatibilityIssue::new(
                    IssueKind::AppVersion,
                    Severity::Warning,
                    "Plugin may not be compatible with this app version",
                )
                .with_details(format!("Supported up to {}, current {}", max, app_version)),
            );
        }
    }

    for dep in &manifest.dependencies {
        match installed.iter().find(|p| p.id == dep.id) {
            None => issues.push(
                CompatibilityIssue::new(
                    IssueKind::MissingDependency,
                    if dep.optional {
                        Severity::Warning
                    } else {
                        Severity::Error
                    },
                    format!("Missing dependency: {}", dep.id),
                )
                .with_details(format!("Requires {}", dep.version)),
            ),
            Some(found) if !satisfies_range(&found.version, &dep.version) => issues.push(
                CompatibilityIssue::new(
                    IssueKind::DependencyVersion,
                    Severity::Error,
                    format!("Incompatible dependency version: {}", dep.id),
                )
                .with_details(format!("Requires {}, installed {}", dep.version, found.version)),
            ),
            Some(_) => {}
        }
    }

    for other in installed.iter().filter(|p| p.id != manifest.id) {
        for node_id in manifest.contributes.node_ids() {
            if other.contributes.node_ids().any(|n| n == node_id) {
                issues.push(
                    CompatibilityIssue::new(
                        IssueKind::NodeConflict,
                        Severity::Error,
                        format!("Node id conflict: {}", node_id),
                    )
                    .with_details(format!("Already provided by {}", other.name)),
                );
            }
        }
    }

    CompatibilityResult::from_issues(issues)
}

/// Check an upgrade between two manifests of the same plugin
///
/// On top of the version checks, newly requested permissions are reported so
/// the host can ask for confirmation again.
pub fn check_manifest_upgrade(current: &PluginManifest, next: &PluginManifest) -> CompatibilityResult {
    let mut issues = Vec::new();
    upgrade_issues(&current.version, &next.version, &mut issues);

    let added = next.permissions.difference(&current.permissions);
    if !added.is_empty() {
        let names: Vec<&str> = added.iter().map(|p| p.as_str()).collect();
        issues.push(
            CompatibilityIssue::new(
                IssueKind::NewPermissions,
                Severity::Warning,
                format!("New permissions requested: {}", names.join(", ")),
            )
            .with_details("User confirmation required"),
        );
    }

    CompatibilityResult::from_issues(issues)
}
