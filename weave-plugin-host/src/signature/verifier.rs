//! Verifying signed plugin packages

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use weave_plugin_api::PluginManifest;

use super::checksum::{collect_package_files, is_valid_package_path, verify_checksum};
use super::file::{decode_public_key, decode_signature, key_fingerprint, Certificate, SignatureFile, SignerInfo};
use super::{codes, SignatureFileError, MANIFEST_FILE_NAME};

/// Default window for `CERTIFICATE_EXPIRING_SOON`
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// A fatal verification problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureError {
    pub code: String,
    pub message: String,
}

/// A non-fatal verification finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureWarning {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureVerificationResult {
    pub valid: bool,
    pub trusted: bool,
    pub signer: Option<SignerInfo>,
    pub errors: Vec<SignatureError>,
    pub warnings: Vec<SignatureWarning>,
}

impl SignatureVerificationResult {
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }
}

/// A plugin package held in memory
#[derive(Debug, Clone)]
pub struct PluginPackage {
    pub manifest: PluginManifest,
    /// Relative `/`-separated path to contents; excludes `signature.json`
    pub files: BTreeMap<String, Vec<u8>>,
}

impl PluginPackage {
    pub fn new(manifest: PluginManifest, files: BTreeMap<String, Vec<u8>>) -> Self {
        Self { manifest, files }
    }

    /// Read every file of a package directory
    pub fn from_dir(root: &Path) -> Result<Self, SignatureFileError> {
        let mut files = BTreeMap::new();
        for name in collect_package_files(root)? {
            let data = std::fs::read(root.join(&name))?;
            files.insert(name, data);
        }
        let raw = files
            .get(MANIFEST_FILE_NAME)
            .ok_or_else(|| SignatureFileError::MissingManifest(root.to_path_buf()))?;
        let manifest = PluginManifest::from_json(&String::from_utf8_lossy(raw))?;
        Ok(Self { manifest, files })
    }
}

#[derive(Debug, Clone)]
struct TrustedKey {
    name: String,
    key: VerifyingKey,
}

/// Trusted root keys and revoked key fingerprints
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    roots: Vec<TrustedKey>,
    revoked: HashSet<String>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust a root key under a name
    ///
    /// Packages signed directly by this key are trusted, as are packages
    /// whose certificate names it as issuer.
    pub fn trust(mut self, name: impl Into<String>, key: VerifyingKey) -> Self {
        self.add_trusted(name, key);
        self
    }

    pub fn add_trusted(&mut self, name: impl Into<String>, key: VerifyingKey) {
        self.roots.push(TrustedKey {
            name: name.into(),
            key,
        });
    }

    /// Trust a base64-encoded root key
    pub fn trust_encoded(mut self, name: impl Into<String>, encoded: &str) -> Result<Self, SignatureFileError> {
        let key = decode_public_key(encoded)?;
        self.add_trusted(name, key);
        Ok(self)
    }

    /// Revoke a key by its hex fingerprint
    pub fn revoke(mut self, fingerprint: impl Into<String>) -> Self {
        self.revoked.insert(fingerprint.into().to_ascii_lowercase());
        self
    }

    pub fn is_revoked(&self, key: &VerifyingKey) -> bool {
        self.revoked.contains(&key_fingerprint(key))
    }

    pub fn is_trusted(&self, key: &VerifyingKey) -> bool {
        !self.is_revoked(key) && self.roots.iter().any(|r| r.key == *key)
    }

    fn root(&self, name: &str) -> Option<&VerifyingKey> {
        self.roots.iter().find(|r| r.name == name).map(|r| &r.key)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Verifies package integrity and signer trust
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    trust: TrustStore,
    require_trusted: bool,
    expiry_warning: Duration,
}

struct Findings {
    errors: Vec<SignatureError>,
    warnings: Vec<SignatureWarning>,
}

impl Findings {
    fn error(&mut self, code: &str, message: impl Into<String>) {
        self.errors.push(SignatureError {
            code: code.to_string(),
            message: message.into(),
        });
    }

    fn warn(&mut self, code: &str, message: impl Into<String>) {
        self.warnings.push(SignatureWarning {
            code: code.to_string(),
            message: message.into(),
        });
    }
}

impl SignatureVerifier {
    pub fn new(trust: TrustStore) -> Self {
        Self {
            trust,
            require_trusted: false,
            expiry_warning: Duration::days(EXPIRY_WARNING_DAYS),
        }
    }

    /// Make an untrusted signer an error instead of a warning
    pub fn require_trusted(mut self, require: bool) -> Self {
        self.require_trusted = require;
        self
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    pub fn verify(&self, package: &PluginPackage, signature: &SignatureFile) -> SignatureVerificationResult {
        self.verify_at(package, signature, Utc::now())
    }

    /// Verify as of `now`
    pub fn verify_at(
        &self,
        package: &PluginPackage,
        signature: &SignatureFile,
        now: DateTime<Utc>,
    ) -> SignatureVerificationResult {
        let mut findings = Findings {
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        if signature.plugin_id != package.manifest.id || signature.plugin_version != package.manifest.version {
            findings.error(
                codes::PACKAGE_MISMATCH,
                format!(
                    "Signature is for {}@{}, package is {}@{}",
                    signature.plugin_id,
                    signature.plugin_version,
                    package.manifest.id,
                    package.manifest.version
                ),
            );
        }

        self.check_files(package, signature, &mut findings);

        let mut trusted = false;
        match decode_public_key(&signature.public_key) {
            Err(e) => findings.error(codes::MALFORMED_KEY, e.to_string()),
            Ok(key) => {
                self.check_signature(&key, signature, &mut findings);
                if self.trust.is_revoked(&key) {
                    findings.error(
                        codes::CERTIFICATE_REVOKED,
                        format!("Signing key {} has been revoked", signature.signer.key_id),
                    );
                } else if self.trust.is_trusted(&key) {
                    trusted = true;
                } else {
                    trusted = self.check_certificate(&key, signature, now, &mut findings);
                }
            }
        }

        if !trusted {
            let message = format!("Signer '{}' is not trusted", signature.signer.name);
            if self.require_trusted {
                findings.error(codes::UNTRUSTED_ISSUER, message);
            } else {
                findings.warn(codes::UNTRUSTED_SIGNER, message);
            }
        }

        let valid = findings.errors.is_empty();
        tracing::debug!(
            plugin = %signature.plugin_id,
            valid,
            trusted,
            errors = findings.errors.len(),
            "Verified package signature"
        );

        SignatureVerificationResult {
            valid,
            trusted: trusted && valid,
            signer: Some(signature.signer.clone()),
            errors: findings.errors,
            warnings: findings.warnings,
        }
    }

    fn check_files(&self, package: &PluginPackage, signature: &SignatureFile, findings: &mut Findings) {
        for (path, expected) in &signature.checksums.files {
            if !is_valid_package_path(path) {
                findings.error(codes::INVALID_PATH, format!("Signed path is not allowed: {:?}", path));
                continue;
            }
            match package.files.get(path) {
                None => findings.error(codes::MISSING_FILE, format!("Signed file is missing: {}", path)),
                Some(data) if !verify_checksum(data, expected) => {
                    findings.error(codes::CHECKSUM_MISMATCH, format!("Checksum mismatch: {}", path))
                }
                Some(_) => {}
            }
        }

        for path in package.files.keys() {
            if !signature.checksums.files.contains_key(path) {
                findings.error(codes::UNSIGNED_FILE, format!("File is not covered by the signature: {}", path));
            }
        }
    }

    fn check_signature(&self, key: &VerifyingKey, signature: &SignatureFile, findings: &mut Findings) {
        let verified = decode_signature(&signature.signature)
            .and_then(|sig| {
                key.verify(&signature.payload(), &sig)
                    .map_err(|e| SignatureFileError::InvalidSignature(e.to_string()))
            });
        if let Err(e) = verified {
            findings.error(codes::INVALID_SIGNATURE, e.to_string());
        }
    }

    /// Returns whether the certificate chains to a trusted root
    fn check_certificate(
        &self,
        key: &VerifyingKey,
        signature: &SignatureFile,
        now: DateTime<Utc>,
        findings: &mut Findings,
    ) -> bool {
        let Some(cert) = &signature.certificate else {
            findings.warn(codes::NO_CERTIFICATE, "Package has no signer certificate");
            return false;
        };

        let mut ok = true;

        if decode_public_key(&cert.public_key).ok().as_ref() != Some(key) {
            findings.error(
                codes::CERTIFICATE_KEY_MISMATCH,
                "Certificate public key does not match the signing key",
            );
            ok = false;
        }

        if now < cert.not_before {
            findings.error(
                codes::CERTIFICATE_NOT_YET_VALID,
                format!("Certificate is valid from {}", cert.not_before),
            );
            ok = false;
        } else if now > cert.not_after {
            findings.error(
                codes::CERTIFICATE_EXPIRED,
                format!("Certificate expired at {}", cert.not_after),
            );
            ok = false;
        } else if cert.not_after - now < self.expiry_warning {
            findings.warn(
                codes::CERTIFICATE_EXPIRING_SOON,
                format!("Certificate expires at {}", cert.not_after),
            );
        }

        ok && self.issued_by_root(cert, findings)
    }

    fn issued_by_root(&self, cert: &Certificate, findings: &mut Findings) -> bool {
        let Some(root) = self.trust.root(&cert.issuer) else {
            return false;
        };
        if self.trust.is_revoked(root) {
            findings.error(
                codes::CERTIFICATE_REVOKED,
                format!("Issuer '{}' has been revoked", cert.issuer),
            );
            return false;
        }
        decode_signature(&cert.issuer_signature)
            .map(|sig| root.verify(&cert.canonical_bytes(), &sig).is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{create_signature_file, compute_checksum, encode_public_key, PackageSigner};
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    fn manifest() -> PluginManifest {
        PluginManifest::from_value(json!({
            "id": "demo",
            "name": "Demo",
            "version": "1.0.0",
            "category": "custom",
            "author": "dev",
            "tags": ["demo"],
            "description": "A demo plugin used in tests",
        }))
        .unwrap()
    }

    fn package() -> PluginPackage {
        let mut files = BTreeMap::new();
        files.insert("manifest.json".to_string(), b"{}".to_vec());
        files.insert("index.js".to_string(), b"export default {}".to_vec());
        PluginPackage::new(manifest(), files)
    }

    fn sign(package: &PluginPackage, signer: &PackageSigner) -> SignatureFile {
        let sums = package
            .files
            .iter()
            .map(|(k, v)| (k.clone(), compute_checksum(v)))
            .collect();
        create_signature_file(&package.manifest, sums, signer)
    }

    fn key(n: u8) -> SigningKey {
        SigningKey::from_bytes(&[n; 32])
    }

    #[test]
    fn test_untrusted_signer_is_a_warning() {
        let pkg = package();
        let sig = sign(&pkg, &PackageSigner::new(key(1), "dev"));

        let result = SignatureVerifier::new(TrustStore::new()).verify(&pkg, &sig);
        assert!(result.valid, "{:?}", result.errors);
        assert!(!result.trusted);
        assert!(result.has_warning(codes::UNTRUSTED_SIGNER));
        assert!(result.has_warning(codes::NO_CERTIFICATE));

        let strict = SignatureVerifier::new(TrustStore::new()).require_trusted(true);
        assert!(strict.verify(&pkg, &sig).has_error(codes::UNTRUSTED_ISSUER));
    }

    #[test]
    fn test_directly_trusted_key() {
        let pkg = package();
        let sig = sign(&pkg, &PackageSigner::new(key(1), "dev"));
        let trust = TrustStore::new().trust("dev", key(1).verifying_key());

        let result = SignatureVerifier::new(trust).verify(&pkg, &sig);
        assert!(result.valid);
        assert!(result.trusted);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_file_set_changes() {
        let mut pkg = package();
        let sig = sign(&pkg, &PackageSigner::new(key(1), "dev"));

        pkg.files.remove("index.js");
        pkg.files.insert("extra.js".to_string(), b"1".to_vec());

        let result = SignatureVerifier::new(TrustStore::new()).verify(&pkg, &sig);
        assert!(!result.valid);
        assert!(result.has_error(codes::MISSING_FILE));
        assert!(result.has_error(codes::UNSIGNED_FILE));
    }

    #[test]
    fn test_reshaped_file_listing_is_rejected() {
        let mut pkg = package();
        pkg.files.insert("b.js".to_string(), b"2".to_vec());
        let mut sig = sign(&pkg, &PackageSigner::new(key(1), "dev"));

        // Fold b.js into index.js's entry without re-signing
        let folded = format!("index.js\n{}  b.js", sig.checksums.files["b.js"]);
        let index_sum = sig.checksums.files.remove("index.js").unwrap();
        sig.checksums.files.remove("b.js");
        sig.checksums.files.insert(folded.clone(), index_sum);
        pkg.files.remove("b.js");
        let data = pkg.files.remove("index.js").unwrap();
        pkg.files.insert(folded, data);

        let result = SignatureVerifier::new(TrustStore::new()).verify(&pkg, &sig);
        assert!(!result.valid);
        assert!(result.has_error(codes::INVALID_SIGNATURE));
        assert!(result.has_error(codes::INVALID_PATH));
    }

    #[test]
    fn test_control_character_paths_never_verify() {
        let mut pkg = package();
        pkg.files.insert("evil\r.js".to_string(), b"1".to_vec());
        let sig = sign(&pkg, &PackageSigner::new(key(1), "dev"));

        let result = SignatureVerifier::new(TrustStore::new()).verify(&pkg, &sig);
        assert!(!result.valid);
        assert!(result.has_error(codes::INVALID_PATH));
    }

    #[test]
    fn test_tampered_signature_and_key() {
        let pkg = package();
        let mut sig = sign(&pkg, &PackageSigner::new(key(1), "dev"));
        sig.plugin_version = "1.0.1".to_string();

        let result = SignatureVerifier::new(TrustStore::new()).verify(&pkg, &sig);
        assert!(result.has_error(codes::INVALID_SIGNATURE));
        assert!(result.has_error(codes::PACKAGE_MISMATCH));

        sig.public_key = "AAAA".to_string();
        let result = SignatureVerifier::new(TrustStore::new()).verify(&pkg, &sig);
        assert!(result.has_error(codes::MALFORMED_KEY));
    }

    #[test]
    fn test_revoked_key() {
        let pkg = package();
        let sig = sign(&pkg, &PackageSigner::new(key(1), "dev"));
        let trust = TrustStore::new()
            .trust("dev", key(1).verifying_key())
            .revoke(key_fingerprint(&key(1).verifying_key()));

        let result = SignatureVerifier::new(trust).verify(&pkg, &sig);
        assert!(result.has_error(codes::CERTIFICATE_REVOKED));
        assert!(!result.trusted);
    }

    #[test]
    fn test_certificate_chain() {
        let root = key(9);
        let signer_key = key(2);
        let now = Utc::now();
        let cert = Certificate::issue(
            "dev",
            &signer_key.verifying_key(),
            "weave-root",
            &root,
            now - Duration::days(1),
            now + Duration::days(365),
        );
        let pkg = package();
        let sig = sign(&pkg, &PackageSigner::new(signer_key, "dev").with_certificate(cert.clone()));
        let trust = TrustStore::new().trust("weave-root", root.verifying_key());
        let verifier = SignatureVerifier::new(trust);

        let result = verifier.verify_at(&pkg, &sig, now);
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.trusted);

        let soon = verifier.verify_at(&pkg, &sig, now + Duration::days(350));
        assert!(soon.has_warning(codes::CERTIFICATE_EXPIRING_SOON));
        assert!(soon.trusted);

        let late = verifier.verify_at(&pkg, &sig, now + Duration::days(400));
        assert!(late.has_error(codes::CERTIFICATE_EXPIRED));

        let early = verifier.verify_at(&pkg, &sig, now - Duration::days(2));
        assert!(early.has_error(codes::CERTIFICATE_NOT_YET_VALID));
    }

    #[test]
    fn test_certificate_for_other_key() {
        let root = key(9);
        let now = Utc::now();
        let cert = Certificate::issue(
            "dev",
            &key(3).verifying_key(),
            "weave-root",
            &root,
            now - Duration::days(1),
            now + Duration::days(365),
        );
        let pkg = package();
        let sig = sign(&pkg, &PackageSigner::new(key(2), "dev").with_certificate(cert));
        let trust = TrustStore::new().trust("weave-root", root.verifying_key());

        let result = SignatureVerifier::new(trust).verify_at(&pkg, &sig, now);
        assert!(result.has_error(codes::CERTIFICATE_KEY_MISMATCH));
        assert!(!result.trusted);
    }

    #[test]
    fn test_forged_certificate_is_untrusted() {
        let now = Utc::now();
        let mut cert = Certificate::issue(
            "dev",
            &key(2).verifying_key(),
            "weave-root",
            &key(4),
            now - Duration::days(1),
            now + Duration::days(365),
        );
        cert.public_key = encode_public_key(&key(2).verifying_key());
        let pkg = package();
        let sig = sign(&pkg, &PackageSigner::new(key(2), "dev").with_certificate(cert));
        let trust = TrustStore::new().trust("weave-root", key(9).verifying_key());

        let result = SignatureVerifier::new(trust).verify_at(&pkg, &sig, now);
        assert!(result.valid);
        assert!(!result.trusted);
        assert!(result.has_warning(codes::UNTRUSTED_SIGNER));
    }
}
