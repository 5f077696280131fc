//! weave-plugin-api: Shared types for the weave plugin system
//!
//! This crate defines the static contract between the host and plugin
//! authors: the manifest format, the permission catalogue, and the semantic
//! version model used for dependency and upgrade checks.

pub mod compat;
pub mod manifest;
pub mod permission;
pub mod version;

pub use compat::{check_compatibility, check_manifest_upgrade};
pub use manifest::{
    is_valid_id, validate_manifest, Category, CommandContribution, Contributions,
    KeybindingContribution, ManifestError, ManifestIssue, ManifestReport, MenuContribution,
    PluginDependency, PluginManifest, ViewContribution,
};
pub use permission::{
    PermissionCategory, PermissionLevel, PermissionMetadata, PermissionSet, PluginPermission,
    UnknownPermission,
};
pub use version::{
    bump_version, check_upgrade_compatibility, compare_versions, is_version_compatible,
    parse_version, satisfies_range, CompatibilityIssue, CompatibilityResult, IssueKind,
    SemanticVersion, Severity, VersionBump, VersionError,
};

/// Manifest schema version understood by this crate
pub const API_VERSION: u32 = 1;
