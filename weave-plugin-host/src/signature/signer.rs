//! Producing signatures for plugin packages

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use std::collections::BTreeMap;
use std::path::Path;
use weave_plugin_api::PluginManifest;

use super::checksum::{collect_package_files, compute_file_checksums};
use super::file::{
    canonical_payload, encode_public_key, key_id, Certificate, ChecksumSet, SignatureFile,
    SignerInfo, CHECKSUM_ALGORITHM, SIGNATURE_ALGORITHM, SIGNATURE_FORMAT_VERSION,
};
use super::SignatureFileError;

/// An ed25519 key plus the identity it signs as
pub struct PackageSigner {
    key: SigningKey,
    info: SignerInfo,
    certificate: Option<Certificate>,
}

impl PackageSigner {
    pub fn new(key: SigningKey, name: impl Into<String>) -> Self {
        let info = SignerInfo {
            name: name.into(),
            email: None,
            key_id: key_id(&key.verifying_key()),
        };
        Self {
            key,
            info,
            certificate: None,
        }
    }

    /// Load a base64-encoded 32-byte secret key from a file
    pub fn from_key_file(path: &Path, name: impl Into<String>) -> Result<Self, SignatureFileError> {
        let content = std::fs::read_to_string(path)?;
        let bytes = BASE64_STANDARD
            .decode(content.trim())
            .map_err(|e| SignatureFileError::InvalidKey(format!("Invalid key encoding: {e}")))?;
        let secret: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| SignatureFileError::InvalidKey("Secret key must be 32 bytes".to_string()))?;
        Ok(Self::new(SigningKey::from_bytes(&secret), name))
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.info.email = Some(email.into());
        self
    }

    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn info(&self) -> &SignerInfo {
        &self.info
    }

    pub fn public_key(&self) -> String {
        encode_public_key(&self.key.verifying_key())
    }

    fn sign(&self, payload: &[u8]) -> String {
        BASE64_STANDARD.encode(self.key.sign(payload).to_bytes())
    }
}

impl std::fmt::Debug for PackageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageSigner")
            .field("info", &self.info)
            .field("certificate", &self.certificate.is_some())
            .finish_non_exhaustive()
    }
}

/// Sign a set of file checksums for `manifest`
pub fn create_signature_file(
    manifest: &PluginManifest,
    files: BTreeMap<String, String>,
    signer: &PackageSigner,
) -> SignatureFile {
    let payload = canonical_payload(&manifest.id, &manifest.version, &files);
    SignatureFile {
        version: SIGNATURE_FORMAT_VERSION,
        plugin_id: manifest.id.clone(),
        plugin_version: manifest.version.clone(),
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        checksums: ChecksumSet {
            algorithm: CHECKSUM_ALGORITHM.to_string(),
            files,
        },
        signer: signer.info.clone(),
        public_key: signer.public_key(),
        certificate: signer.certificate.clone(),
        signature: signer.sign(&payload),
        signed_at: Utc::now(),
    }
}

/// Checksum every file in a package directory and sign the result
pub fn sign_directory(
    root: &Path,
    manifest: &PluginManifest,
    signer: &PackageSigner,
) -> Result<SignatureFile, SignatureFileError> {
    let files = collect_package_files(root)?;
    let checksums = compute_file_checksums(root, &files)?;
    tracing::debug!(
        plugin = %manifest.id,
        files = checksums.len(),
        signer = %signer.info.name,
        "Signing package"
    );
    Ok(create_signature_file(manifest, checksums, signer))
}
