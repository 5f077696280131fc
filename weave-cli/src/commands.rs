//! Command implementations behind the `weave` binary
//!
//! Every command returns data; printing and exit codes belong to `main`.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use weave_plugin_api::{check_upgrade_compatibility, is_valid_id, validate_manifest, CompatibilityResult};
use weave_plugin_host::marketplace::pack;
use weave_plugin_host::signature::{
    parse_signature_file, serialize_signature_file, sign_directory, PackageSigner, SignatureFile,
    MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME,
};
use weave_plugin_host::{
    DryRunTransport, PluginManifest, PluginPackage, PublishRequest, PublishResult, PublisherClient,
    SignatureVerificationResult, SignatureVerifier, TrustStore,
};
use weave_plugin_sdk::prelude::*;
use weave_plugin_sdk::validate_node_definition;

pub const README_FILE_NAME: &str = "README.md";
pub const CHANGELOG_FILE_NAME: &str = "CHANGELOG.md";

/// One problem, attributed to a manifest field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub field: String,
    pub message: String,
}

impl Issue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Outcome of `weave validate`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn read_manifest_value(dir: &Path) -> Result<Value> {
    let path = dir.join(MANIFEST_FILE_NAME);
    let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path.display()))
}

// ============================================================================
// init
// ============================================================================

/// Scaffold a plugin directory with a manifest, one example node and a README
pub fn init(dir: &Path, id: &str, name: Option<&str>) -> Result<PathBuf> {
    if !is_valid_id(id) {
        bail!("Invalid plugin id '{}': use lowercase letters, digits and hyphens", id);
    }
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    if manifest_path.exists() {
        bail!("{} already exists", manifest_path.display());
    }

    let name = name.map(str::to_string).unwrap_or_else(|| title_case(id));
    let node = define_node(
        NodeConfig::new(format!("{}-echo", id), "Echo")
            .description("Returns its input unchanged")
            .category(NodeCategory::Action)
            .input("message", InputField::new(DataType::String, "Message").required())
            .output("message", OutputField::new(DataType::String, "Message"))
            .execute(|ctx| async move { Ok(ctx.inputs) }),
    )?;

    let manifest = json!({
        "id": id,
        "name": name,
        "version": "0.1.0",
        "description": format!("{} nodes for weave workflows", name),
        "category": "custom",
        "permissions": [],
        "main": format!("{}/index", id),
        "contributes": { "nodes": [node.serialize()] },
    });

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
    let readme = dir.join(README_FILE_NAME);
    if !readme.exists() {
        fs::write(&readme, format!("# {}\n", name))?;
    }

    tracing::info!(plugin = %id, dir = %dir.display(), "Plugin scaffolded");
    Ok(manifest_path)
}

fn title_case(id: &str) -> String {
    id.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// validate
// ============================================================================

/// Validate the manifest and every contributed node descriptor
pub fn validate(dir: &Path) -> Result<Report> {
    let raw = read_manifest_value(dir)?;
    let manifest = validate_manifest(&raw);

    let mut report = Report {
        errors: manifest.errors.iter().map(|i| Issue::new(&i.field, &i.message)).collect(),
        warnings: manifest.warnings.iter().map(|i| Issue::new(&i.field, &i.message)).collect(),
    };

    let nodes = raw
        .pointer("/contributes/nodes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (index, node) in nodes.iter().enumerate() {
        for error in validate_node_definition(node).errors {
            let field = if error.field.is_empty() {
                format!("contributes.nodes[{}]", index)
            } else {
                format!("contributes.nodes[{}].{}", index, error.field)
            };
            report.errors.push(Issue::new(field, error.message));
        }
    }

    tracing::debug!(
        dir = %dir.display(),
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "Plugin validated"
    );
    Ok(report)
}

// ============================================================================
// sign / verify
// ============================================================================

/// Sign every file of the package and write `signature.json`
pub fn sign(dir: &Path, key_file: &Path, signer: &str, email: Option<&str>) -> Result<SignatureFile> {
    let manifest = PluginManifest::from_json(&fs::read_to_string(dir.join(MANIFEST_FILE_NAME))?)
        .context("Manifest must be valid before signing")?;

    let mut package_signer = PackageSigner::from_key_file(key_file, signer)
        .with_context(|| format!("Failed to load signing key from {}", key_file.display()))?;
    if let Some(email) = email {
        package_signer = package_signer.with_email(email);
    }

    let signature = sign_directory(dir, &manifest, &package_signer)?;
    let path = dir.join(SIGNATURE_FILE_NAME);
    fs::write(&path, serialize_signature_file(&signature)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    tracing::info!(
        plugin = %manifest.id,
        version = %manifest.version,
        files = signature.checksums.files.len(),
        key_id = %signature.signer.key_id,
        "Package signed"
    );
    Ok(signature)
}

/// Verify `signature.json` against the package contents
///
/// With no trusted keys only integrity is checked; with some, the signer
/// must chain to one of them.
pub fn verify(dir: &Path, trusted_keys: &[String]) -> Result<SignatureVerificationResult> {
    let path = dir.join(SIGNATURE_FILE_NAME);
    let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let signature = parse_signature_file(&content)?;
    let package = PluginPackage::from_dir(dir)?;

    let mut trust = TrustStore::new();
    for (index, key) in trusted_keys.iter().enumerate() {
        trust = trust
            .trust_encoded(format!("cli-{}", index), key)
            .with_context(|| format!("Invalid trusted key '{}'", key))?;
    }

    let verifier = SignatureVerifier::new(trust).require_trusted(!trusted_keys.is_empty());
    Ok(verifier.verify(&package, &signature))
}

// ============================================================================
// check-upgrade / publish
// ============================================================================

pub fn check_upgrade(from: &str, to: &str) -> CompatibilityResult {
    check_upgrade_compatibility(from, to)
}

/// Validate and pack a plugin, then hand it to a dry-run transport
pub async fn publish(dir: &Path, dry_run: bool) -> Result<PublishResult> {
    if !dry_run {
        bail!("Only dry-run publishing is supported; pass --dry-run");
    }

    let package = PluginPackage::from_dir(dir)?;
    let read_optional = |name: &str| fs::read_to_string(dir.join(name)).ok();
    let request = PublishRequest {
        manifest: package.manifest.clone(),
        package: pack(&package),
        readme: read_optional(README_FILE_NAME),
        changelog: read_optional(CHANGELOG_FILE_NAME),
    };

    Ok(PublisherClient::new(DryRunTransport::new()).publish(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("http-tools"), "Http Tools");
        assert_eq!(title_case("demo"), "Demo");
        assert_eq!(title_case("a--b"), "A B");
    }

    #[test]
    fn test_report_is_ok() {
        let mut report = Report::default();
        report.warnings.push(Issue::new("author", "Author is recommended"));
        assert!(report.is_ok());

        report.errors.push(Issue::new("id", "Plugin id is required"));
        assert!(!report.is_ok());
    }

    #[test]
    fn test_check_upgrade_major_is_breaking() {
        assert!(check_upgrade("1.2.0", "2.0.0").has_breaking_change());
        assert!(check_upgrade("1.2.0", "1.3.0").compatible);
    }
}
