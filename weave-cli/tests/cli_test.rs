//! End-to-end tests for the weave command line

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::SigningKey;
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use weave_cli::commands;
use weave_plugin_host::signature::{codes, MANIFEST_FILE_NAME, SIGNATURE_FILE_NAME};

fn weave(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_weave"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn write_key(dir: &Path, seed: u8) -> (std::path::PathBuf, String) {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let path = dir.join("signing.key");
    std::fs::write(&path, STANDARD.encode(key.to_bytes())).unwrap();
    (path, STANDARD.encode(key.verifying_key().to_bytes()))
}

#[test]
fn test_init_produces_valid_plugin() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("http-tools");

    commands::init(&dir, "http-tools", None).unwrap();

    let manifest: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join(MANIFEST_FILE_NAME)).unwrap()).unwrap();
    assert_eq!(manifest["name"], "Http Tools");
    assert_eq!(manifest["contributes"]["nodes"][0]["id"], "http-tools-echo");

    let report = commands::validate(&dir).unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);

    // A second init must not clobber the manifest
    assert!(commands::init(&dir, "http-tools", None).is_err());
    assert!(commands::init(&temp.path().join("bad"), "Bad_Id", None).is_err());
}

#[test]
fn test_validate_reports_fields() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(
        temp.path().join(MANIFEST_FILE_NAME),
        r#"{"id": "demo", "name": "Demo", "version": "1.0", "category": "custom",
            "contributes": {"nodes": [{"id": "echo", "name": "Echo", "version": "1.0.0", "category": "nope"}]}}"#,
    )
    .unwrap();

    let report = commands::validate(temp.path()).unwrap();
    let fields: Vec<&str> = report.errors.iter().map(|e| e.field.as_str()).collect();
    assert!(fields.contains(&"version"), "{:?}", fields);
    assert!(fields.contains(&"contributes.nodes[0].category"), "{:?}", fields);
}

#[test]
fn test_sign_then_verify() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("demo");
    commands::init(&dir, "demo", None).unwrap();
    let (key, public) = write_key(temp.path(), 7);

    let signature = commands::sign(&dir, &key, "Demo Publisher", Some("dev@example.com")).unwrap();
    assert!(dir.join(SIGNATURE_FILE_NAME).is_file());
    assert!(signature.checksums.files.contains_key(MANIFEST_FILE_NAME));

    let untrusted = commands::verify(&dir, &[]).unwrap();
    assert!(untrusted.valid);
    assert!(!untrusted.trusted);

    let trusted = commands::verify(&dir, &[public]).unwrap();
    assert!(trusted.valid, "{:?}", trusted.errors);
    assert!(trusted.trusted);

    std::fs::write(dir.join("README.md"), "# Tampered\n").unwrap();
    let tampered = commands::verify(&dir, &[]).unwrap();
    assert!(!tampered.valid);
    assert!(tampered.has_error(codes::CHECKSUM_MISMATCH));
}

#[test]
fn test_verify_with_wrong_trusted_key_fails() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("demo");
    commands::init(&dir, "demo", None).unwrap();
    let (key, _) = write_key(temp.path(), 7);
    commands::sign(&dir, &key, "Demo Publisher", None).unwrap();

    let other = STANDARD.encode(SigningKey::from_bytes(&[9; 32]).verifying_key().to_bytes());
    let result = commands::verify(&dir, &[other]).unwrap();
    assert!(!result.valid);
}

#[tokio::test]
async fn test_publish_dry_run() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("demo");
    commands::init(&dir, "demo", None).unwrap();

    let result = commands::publish(&dir, true).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.plugin_id.as_deref(), Some("demo"));
    assert_eq!(result.version.as_deref(), Some("0.1.0"));

    assert!(commands::publish(&dir, false).await.is_err());
}

#[test]
fn test_binary_exit_codes() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("demo");
    let dir_arg = dir.to_str().unwrap();

    let init = weave(&["init", dir_arg, "--id", "demo"]);
    assert!(init.status.success(), "{}", String::from_utf8_lossy(&init.stderr));

    let valid = weave(&["validate", dir_arg]);
    assert!(valid.status.success());
    assert!(String::from_utf8_lossy(&valid.stdout).contains("is valid"));

    std::fs::write(dir.join(MANIFEST_FILE_NAME), r#"{"id": "Demo"}"#).unwrap();
    let invalid = weave(&["validate", dir_arg]);
    assert_eq!(invalid.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&invalid.stdout).contains("error: id:"));

    let upgrade = weave(&["check-upgrade", "1.0.0", "2.0.0"]);
    assert!(upgrade.status.success());
    assert!(String::from_utf8_lossy(&upgrade.stdout).contains("breaking"));

    let bad_version = weave(&["check-upgrade", "1.0", "2.0.0"]);
    assert_eq!(bad_version.status.code(), Some(1));

    let missing = weave(&["verify", temp.path().join("nowhere").to_str().unwrap()]);
    assert_eq!(missing.status.code(), Some(1));
}
