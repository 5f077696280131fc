//! Integration tests for signing, loading and managing plugins

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use weave_plugin_api::check_upgrade_compatibility;
use weave_plugin_host::signature::{
    codes, serialize_signature_file, sign_directory, PackageSigner, MANIFEST_FILE_NAME,
    SIGNATURE_FILE_NAME,
};
use weave_plugin_host::sandbox::{CommandError, HostApiError};
use weave_plugin_host::{
    Disposable, HostApi, HostPresets, ModuleResolver, PluginApi, PluginContext, PluginManifest,
    PluginModule, PluginPackage, PluginPermission, PluginRegistry, PluginState, RegistryError,
    SignatureVerifier, TrustStore,
};

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[1; 32])
}

fn write_demo(dir: &Path, version: &str) {
    std::fs::create_dir_all(dir.join("dist")).unwrap();
    let manifest = json!({
        "id": "demo",
        "name": "Demo",
        "version": version,
        "category": "custom",
        "permissions": ["storage"],
        "main": "demo/index",
    });
    std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest.to_string()).unwrap();
    std::fs::write(dir.join("dist").join("index.js"), format!("export const version = '{}';", version)).unwrap();
}

fn sign(dir: &Path) {
    let manifest = PluginManifest::from_json(&std::fs::read_to_string(dir.join(MANIFEST_FILE_NAME)).unwrap()).unwrap();
    let signer = PackageSigner::new(signing_key(), "Demo Publisher");
    let signature = sign_directory(dir, &manifest, &signer).unwrap();
    std::fs::write(dir.join(SIGNATURE_FILE_NAME), serialize_signature_file(&signature).unwrap()).unwrap();
}

/// Counts activations in its own storage and tries an ungranted capability
struct Demo;

#[async_trait]
impl PluginModule for Demo {
    async fn activate(&self, ctx: PluginContext, api: PluginApi) -> anyhow::Result<()> {
        let storage = api.storage()?;
        let count = storage.get("activations").await?.and_then(|v| v.as_u64()).unwrap_or(0);
        storage.set("activations", json!(count + 1)).await?;
        storage.set("version", json!(ctx.version())).await?;

        if let Err(denied) = api.http() {
            storage.set("network", json!(denied.permission.as_str())).await?;
        }

        ctx.subscribe(api.commands().register("demo.version", |_args| async { Ok(json!("demo")) })?);
        Ok(())
    }
}

/// Registry that trusts the demo key and keeps its state in `plugins_dir`
fn demo_registry(host_api: HostApi, plugins_dir: &Path) -> PluginRegistry {
    let config = HostPresets::testing()
        .plugins_dir(plugins_dir)
        .allow_unsigned(false)
        .trust(TrustStore::new().trust("demo", signing_key().verifying_key()))
        .require_trusted(true)
        .host_api(host_api)
        .build()
        .unwrap();
    PluginRegistry::new(config, ModuleResolver::new().with("demo/index", || Demo))
}

async fn stored(host_api: &HostApi, key: &str) -> Option<Value> {
    host_api.storage.get(&format!("plugin:demo:{}", key)).await.unwrap()
}

#[tokio::test]
async fn test_demo_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("demo");
    write_demo(&plugin_dir, "1.0.0");
    sign(&plugin_dir);

    let host_api = HostApi::in_memory();
    let registry = demo_registry(host_api.clone(), dir.path());
    let plugin = registry.load_plugin(&plugin_dir).await.unwrap();

    assert_eq!(plugin.state(), PluginState::Active);
    assert!(plugin.signature.is_some());
    assert_eq!(stored(&host_api, "activations").await, Some(json!(1)));
    assert_eq!(stored(&host_api, "network").await, Some(json!("network")));

    let denied = plugin.api().http().unwrap_err();
    assert_eq!(denied.plugin_id, "demo");
    assert_eq!(denied.permission, PluginPermission::Network);

    // 2.0.0 is a breaking upgrade
    write_demo(&plugin_dir, "2.0.0");
    sign(&plugin_dir);
    assert!(check_upgrade_compatibility("1.0.0", "2.0.0").has_breaking_change());

    let upgraded = registry.reload("demo").await.unwrap();
    assert_eq!(upgraded.version(), "2.0.0");
    assert_eq!(stored(&host_api, "activations").await, Some(json!(2)));
    assert_eq!(stored(&host_api, "version").await, Some(json!("2.0.0")));
}

#[tokio::test]
async fn test_unsigned_demo_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    write_demo(dir.path(), "1.0.0");

    let registry = demo_registry(HostApi::in_memory(), dir.path());
    assert!(registry.load_plugin(dir.path()).await.is_err());
    assert_eq!(registry.state_of("demo").await, Some(PluginState::Error));
}

#[test]
fn test_single_byte_tamper_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    write_demo(dir.path(), "1.0.0");
    std::fs::write(dir.path().join("dist").join("helper.js"), "export default 1;").unwrap();
    let manifest = PluginManifest::from_json(&std::fs::read_to_string(dir.path().join(MANIFEST_FILE_NAME)).unwrap()).unwrap();
    let signature = sign_directory(dir.path(), &manifest, &PackageSigner::new(signing_key(), "Demo Publisher")).unwrap();

    let verifier = SignatureVerifier::new(TrustStore::new().trust("demo", signing_key().verifying_key()));
    let package = PluginPackage::from_dir(dir.path()).unwrap();
    assert!(verifier.verify(&package, &signature).valid);

    let target = dir.path().join("dist").join("index.js");
    let mut bytes = std::fs::read(&target).unwrap();
    bytes[0] ^= 0x01;
    std::fs::write(&target, bytes).unwrap();

    let package = PluginPackage::from_dir(dir.path()).unwrap();
    let result = verifier.verify(&package, &signature);
    assert!(!result.valid);

    let mismatches: Vec<_> = result
        .errors
        .iter()
        .filter(|e| e.code == codes::CHECKSUM_MISMATCH)
        .collect();
    assert_eq!(mismatches.len(), 1);
    assert!(mismatches[0].message.contains("dist/index.js"));
}

/// Registers three disposables; the middle one fails
struct Tidy {
    order: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl PluginModule for Tidy {
    async fn activate(&self, ctx: PluginContext, _api: PluginApi) -> anyhow::Result<()> {
        for name in ["A", "B", "C"] {
            let order = self.order.clone();
            ctx.subscribe(Disposable::new(name, move || {
                order.lock().unwrap().push(name);
                if name == "B" {
                    Err("B refused".to_string())
                } else {
                    Ok(())
                }
            }));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_disposal_runs_in_reverse_past_failures() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(MANIFEST_FILE_NAME),
        json!({ "id": "tidy", "name": "Tidy", "version": "1.0.0", "category": "custom", "main": "tidy" }).to_string(),
    )
    .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let shared = order.clone();
    let resolver = ModuleResolver::new().with("tidy", move || Tidy { order: shared.clone() });
    let config = HostPresets::testing().plugins_dir(dir.path()).build().unwrap();
    let registry = PluginRegistry::new(config, resolver);

    let plugin = registry.load_plugin(dir.path()).await.unwrap();
    registry.unregister("tidy").await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
    assert_eq!(plugin.state(), PluginState::Installed);
}

#[tokio::test]
async fn test_hot_swap_keeps_old_handle_working() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("demo");
    write_demo(&plugin_dir, "1.0.0");
    sign(&plugin_dir);

    let host_api = HostApi::in_memory();
    let registry = demo_registry(host_api.clone(), dir.path());
    let old = registry.load_plugin(&plugin_dir).await.unwrap();
    let first_generation = registry.generation("demo").await.unwrap();

    write_demo(&plugin_dir, "1.1.0");
    sign(&plugin_dir);
    let fresh = registry.reload("demo").await.unwrap();

    assert!(!Arc::ptr_eq(&old, &fresh));
    assert!(registry.generation("demo").await.unwrap() > first_generation);
    assert!(Arc::ptr_eq(&registry.get("demo").await.unwrap(), &fresh));

    // The retired handle still reaches its storage
    let storage = old.api().storage().unwrap();
    assert_eq!(storage.get("version").await.unwrap(), Some(json!("1.1.0")));
    assert_eq!(old.version(), "1.0.0");

    // Retiring the old handle leaves the new registration in place
    assert!(host_api.commands.contains("demo.version"));
    assert_eq!(host_api.commands.owner("demo.version").as_deref(), Some("demo"));
}

/// Activates with no permissions and nothing of its own
struct Bystander;

impl PluginModule for Bystander {}

#[tokio::test]
async fn test_plugins_cannot_reach_each_others_commands() {
    let dir = tempfile::tempdir().unwrap();
    let demo_dir = dir.path().join("demo");
    write_demo(&demo_dir, "1.0.0");
    let other_dir = dir.path().join("other");
    std::fs::create_dir_all(&other_dir).unwrap();
    std::fs::write(
        other_dir.join(MANIFEST_FILE_NAME),
        json!({ "id": "other", "name": "Other", "version": "1.0.0", "category": "custom", "main": "other" }).to_string(),
    )
    .unwrap();

    let host_api = HostApi::in_memory();
    let config = HostPresets::testing()
        .plugins_dir(dir.path())
        .host_api(host_api.clone())
        .build()
        .unwrap();
    let resolver = ModuleResolver::new()
        .with("demo/index", || Demo)
        .with("other", || Bystander);
    let registry = PluginRegistry::new(config, resolver);
    registry.load_plugin(&demo_dir).await.unwrap();
    let other = registry.load_plugin(&other_dir).await.unwrap();
    assert!(other.granted.is_empty());

    let commands = other.api().commands();
    let hijack = commands
        .register("demo.version", |_args| async { Ok(json!("other")) })
        .unwrap_err();
    assert!(matches!(hijack, HostApiError::Command(CommandError::OutsideNamespace { .. })));
    let call = commands.execute("demo.version", Value::Null).await.unwrap_err();
    assert!(matches!(call, HostApiError::Command(CommandError::Foreign { .. })));

    // Its own namespace works, and the host can still reach everything
    let _own = commands.register("other.ping", |_args| async { Ok(json!("pong")) }).unwrap();
    assert_eq!(commands.execute("other.ping", Value::Null).await.unwrap(), json!("pong"));
    assert_eq!(host_api.commands.owner("demo.version").as_deref(), Some("demo"));
    assert_eq!(
        host_api.commands.execute("demo.version", Value::Null).await.unwrap().unwrap(),
        json!("demo")
    );
}

#[tokio::test]
async fn test_disabled_demo_stays_down_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("demo");
    write_demo(&plugin_dir, "1.0.0");
    sign(&plugin_dir);

    let host_api = HostApi::in_memory();
    let registry = demo_registry(host_api.clone(), dir.path());
    registry.load_plugin(&plugin_dir).await.unwrap();
    registry.disable("demo").await.unwrap();
    assert!(!host_api.commands.contains("demo.version"));

    // A file change is not an enable
    write_demo(&plugin_dir, "1.1.0");
    sign(&plugin_dir);
    assert!(matches!(
        registry.reload_by_path(&plugin_dir).await,
        Err(RegistryError::Disabled(_))
    ));
    assert_eq!(registry.state_of("demo").await, Some(PluginState::Disabled));
    registry.deactivate_all().await;

    // Host restart over the same plugins directory
    let restarted = demo_registry(host_api.clone(), dir.path());
    let plugin = restarted.load_plugin(&plugin_dir).await.unwrap();
    assert_eq!(plugin.state(), PluginState::Disabled);
    assert_eq!(stored(&host_api, "activations").await, Some(json!(1)));
    assert!(!host_api.commands.contains("demo.version"));

    let enabled = restarted.enable("demo").await.unwrap();
    assert_eq!(enabled.state(), PluginState::Active);
    assert_eq!(enabled.version(), "1.1.0");
    assert_eq!(stored(&host_api, "activations").await, Some(json!(2)));
    assert!(host_api.commands.contains("demo.version"));
}
