//! Package signatures
//!
//! A package is signed by checksumming every file (SHA-256) and signing a
//! canonical payload built from the plugin id, version and sorted checksum
//! lines with ed25519. The result is stored next to the manifest as
//! `signature.json`.
//!
//! ```text
//! files ──sha256──▶ checksums ──canonical_payload──▶ ed25519 ──▶ signature.json
//!                                                       ▲
//!                                  TrustStore ◀── certificate (optional)
//! ```

pub mod checksum;
pub mod file;
pub mod signer;
pub mod verifier;

use std::path::PathBuf;
use thiserror::Error;

pub use checksum::{
    collect_package_files, compute_checksum, compute_file_checksums, is_valid_package_path, verify_checksum,
};
pub use file::{
    canonical_payload, decode_public_key, encode_public_key, key_fingerprint, key_id,
    parse_signature_file, serialize_signature_file, Certificate, ChecksumSet, SignatureFile,
    SignerInfo,
};
pub use signer::{create_signature_file, sign_directory, PackageSigner};
pub use verifier::{
    PluginPackage, SignatureError, SignatureVerificationResult, SignatureVerifier,
    SignatureWarning, TrustStore,
};

pub const SIGNATURE_FILE_NAME: &str = "signature.json";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Verification result codes
pub mod codes {
    pub const CHECKSUM_MISMATCH: &str = "CHECKSUM_MISMATCH";
    pub const MISSING_FILE: &str = "MISSING_FILE";
    pub const UNSIGNED_FILE: &str = "UNSIGNED_FILE";
    pub const INVALID_PATH: &str = "INVALID_PATH";
    pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
    pub const MALFORMED_KEY: &str = "MALFORMED_KEY";
    pub const CERTIFICATE_EXPIRED: &str = "CERTIFICATE_EXPIRED";
    pub const CERTIFICATE_NOT_YET_VALID: &str = "CERTIFICATE_NOT_YET_VALID";
    pub const CERTIFICATE_REVOKED: &str = "CERTIFICATE_REVOKED";
    pub const CERTIFICATE_KEY_MISMATCH: &str = "CERTIFICATE_KEY_MISMATCH";
    pub const UNTRUSTED_ISSUER: &str = "UNTRUSTED_ISSUER";
    pub const PACKAGE_MISMATCH: &str = "PACKAGE_MISMATCH";

    pub const UNTRUSTED_SIGNER: &str = "UNTRUSTED_SIGNER";
    pub const NO_CERTIFICATE: &str = "NO_CERTIFICATE";
    pub const CERTIFICATE_EXPIRING_SOON: &str = "CERTIFICATE_EXPIRING_SOON";
}

/// Failure to read, parse or produce signature material
#[derive(Debug, Error)]
pub enum SignatureFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid signature file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported signature file version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedChecksumAlgorithm(String),

    #[error("{0}")]
    InvalidKey(String),

    #[error("{0}")]
    InvalidSignature(String),

    #[error("No manifest.json in {}", .0.display())]
    MissingManifest(PathBuf),

    #[error(transparent)]
    Manifest(#[from] weave_plugin_api::ManifestError),
}
