//! `signature.json` format and canonical payloads

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::SignatureFileError;

/// Supported `signature.json` format version
pub const SIGNATURE_FORMAT_VERSION: u32 = 1;
pub const SIGNATURE_ALGORITHM: &str = "ed25519";
pub const CHECKSUM_ALGORITHM: &str = "sha256";

/// Who produced a signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub key_id: String,
}

/// Checksums of every signed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSet {
    pub algorithm: String,
    pub files: BTreeMap<String, String>,
}

/// A signer key endorsed by a trusted root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub subject: String,
    pub issuer: String,
    /// Base64 ed25519 public key of the subject
    pub public_key: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Base64 signature by the issuer over [`Certificate::canonical_bytes`]
    pub issuer_signature: String,
}

impl Certificate {
    /// Issue a certificate for `subject_key`, signed by `issuer_key`
    pub fn issue(
        subject: impl Into<String>,
        subject_key: &VerifyingKey,
        issuer: impl Into<String>,
        issuer_key: &SigningKey,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Self {
        let mut cert = Self {
            subject: subject.into(),
            issuer: issuer.into(),
            public_key: encode_public_key(subject_key),
            not_before,
            not_after,
            issuer_signature: String::new(),
        };
        let signature = issuer_key.sign(&cert.canonical_bytes());
        cert.issuer_signature = BASE64_STANDARD.encode(signature.to_bytes());
        cert
    }

    /// Bytes covered by `issuer_signature`
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "weave-certificate:v1\n{}\n{}\n{}\n{}\n{}\n",
            self.subject,
            self.issuer,
            self.public_key,
            self.not_before.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
        .into_bytes()
    }
}

/// Contents of `signature.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureFile {
    pub version: u32,
    pub plugin_id: String,
    pub plugin_version: String,
    pub algorithm: String,
    pub checksums: ChecksumSet,
    pub signer: SignerInfo,
    /// Base64 ed25519 public key
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    /// Base64 ed25519 signature over [`canonical_payload`]
    pub signature: String,
    pub signed_at: DateTime<Utc>,
}

impl SignatureFile {
    pub fn payload(&self) -> Vec<u8> {
        canonical_payload(&self.plugin_id, &self.plugin_version, &self.checksums.files)
    }
}

/// Bytes that a package signature covers
///
/// One header line, then id and version, then `<hash>  <path>` per file in
/// path order. Every field is written as a JSON string literal, so no field
/// can contain an unescaped separator.
pub fn canonical_payload(plugin_id: &str, plugin_version: &str, files: &BTreeMap<String, String>) -> Vec<u8> {
    let quote = |field: &str| serde_json::Value::String(field.to_string()).to_string();

    let mut payload = format!(
        "weave-plugin-signature:v2\n{}\n{}\n",
        quote(plugin_id),
        quote(plugin_version)
    );
    for (path, checksum) in files {
        payload.push_str(&quote(&checksum.to_ascii_lowercase()));
        payload.push_str("  ");
        payload.push_str(&quote(path));
        payload.push('\n');
    }
    payload.into_bytes()
}

pub fn parse_signature_file(content: &str) -> Result<SignatureFile, SignatureFileError> {
    let file: SignatureFile = serde_json::from_str(content)?;
    if file.version != SIGNATURE_FORMAT_VERSION {
        return Err(SignatureFileError::UnsupportedVersion(file.version));
    }
    if file.algorithm != SIGNATURE_ALGORITHM {
        return Err(SignatureFileError::UnsupportedAlgorithm(file.algorithm));
    }
    if file.checksums.algorithm != CHECKSUM_ALGORITHM {
        return Err(SignatureFileError::UnsupportedChecksumAlgorithm(
            file.checksums.algorithm,
        ));
    }
    Ok(file)
}

pub fn serialize_signature_file(file: &SignatureFile) -> Result<String, SignatureFileError> {
    Ok(serde_json::to_string_pretty(file)?)
}

// ============================================================================
// Key helpers
// ============================================================================

pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE64_STANDARD.encode(key.as_bytes())
}

pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, SignatureFileError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| SignatureFileError::InvalidKey(format!("Invalid key encoding: {e}")))?;

    let key_array: [u8; PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| SignatureFileError::InvalidKey("Public key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&key_array)
        .map_err(|e| SignatureFileError::InvalidKey(format!("Invalid public key: {e}")))
}

pub fn decode_signature(encoded: &str) -> Result<Signature, SignatureFileError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| SignatureFileError::InvalidSignature(format!("Invalid signature encoding: {e}")))?;
    Signature::from_slice(&bytes)
        .map_err(|e| SignatureFileError::InvalidSignature(format!("Invalid signature: {e}")))
}

/// Hex SHA-256 of the raw public key
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Short identifier shown to users (first 16 hex chars of the fingerprint)
pub fn key_id(key: &VerifyingKey) -> String {
    key_fingerprint(key)[..16].to_string()
}
