//! Marketplace publishing
//!
//! [`PublisherClient`] validates a package locally and hands it to a
//! [`PublishTransport`]. The transport owns the wire format; this module only
//! maps its responses onto a [`PublishResult`].

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use weave_plugin_api::{validate_manifest, PluginManifest};
use weave_plugin_sdk::validate_node_definition;

use crate::signature::{compute_checksum, PluginPackage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Transport failed: {0}")]
pub struct TransportError(pub String);

/// What the transport sends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPayload {
    pub manifest: PluginManifest,
    /// Base64 package archive
    pub package: String,
    /// SHA-256 of the decoded package
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

/// What the transport got back
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait PublishTransport: Send + Sync {
    async fn publish(&self, payload: PublishPayload) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub manifest: PluginManifest,
    pub package: Vec<u8>,
    pub readme: Option<String>,
    pub changelog: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishResult {
    fn failed(error: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            warnings,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct PublisherClient {
    transport: Arc<dyn PublishTransport>,
}

impl PublisherClient {
    pub fn new(transport: impl PublishTransport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    pub fn with_shared(transport: Arc<dyn PublishTransport>) -> Self {
        Self { transport }
    }

    /// Validate locally, then publish
    ///
    /// Never fails: every problem lands in [`PublishResult::error`].
    pub async fn publish(&self, request: PublishRequest) -> PublishResult {
        let id = request.manifest.id.clone();
        let mut warnings = Vec::new();
        if let Err(error) = validate_request(&request, &mut warnings) {
            tracing::warn!(plugin = %id, error = %error, "Publish rejected locally");
            return PublishResult::failed(error, warnings);
        }

        let payload = PublishPayload {
            checksum: compute_checksum(&request.package),
            package: STANDARD.encode(&request.package),
            manifest: request.manifest,
            readme: request.readme,
            changelog: request.changelog,
        };
        let version = payload.manifest.version.clone();

        let response = match self.transport.publish(payload).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(plugin = %id, error = %e, "Publish transport failed");
                return PublishResult::failed(e.0, warnings);
            }
        };

        warnings.extend(
            response
                .body
                .get("warnings")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|w| w.as_str().map(str::to_string)),
        );

        if !response.is_success() {
            let error = response
                .body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", response.status));
            tracing::warn!(plugin = %id, status = response.status, error = %error, "Publish refused");
            return PublishResult::failed(error, warnings);
        }

        let field = |name: &str| response.body.get(name).and_then(Value::as_str).map(str::to_string);
        let result = PublishResult {
            success: true,
            plugin_id: field("pluginId").or(Some(id)),
            version: field("version").or(Some(version)),
            warnings,
            error: None,
        };
        tracing::info!(
            plugin = result.plugin_id.as_deref().unwrap_or_default(),
            version = result.version.as_deref().unwrap_or_default(),
            "Plugin published"
        );
        result
    }
}

fn validate_request(request: &PublishRequest, warnings: &mut Vec<String>) -> Result<(), String> {
    let raw = serde_json::to_value(&request.manifest).map_err(|e| e.to_string())?;
    let report = validate_manifest(&raw);
    warnings.extend(report.warnings.iter().map(|w| format!("{}: {}", w.field, w.message)));
    if !report.valid {
        let fields: Vec<String> = report.errors.iter().map(|e| format!("{}: {}", e.field, e.message)).collect();
        return Err(format!("Invalid manifest: {}", fields.join("; ")));
    }

    for node in &request.manifest.contributes.nodes {
        let result = validate_node_definition(node);
        if !result.valid {
            let id = node.get("id").and_then(Value::as_str).unwrap_or("?");
            return Err(format!("Invalid node '{}': {} error(s)", id, result.errors.len()));
        }
    }

    if request.package.is_empty() {
        return Err("Package is empty".to_string());
    }
    if request.readme.as_deref().map_or(true, |r| r.trim().is_empty()) {
        warnings.push("No README provided".to_string());
    }
    Ok(())
}

/// Encode a package as a JSON archive of base64 file contents
pub fn pack(package: &PluginPackage) -> Vec<u8> {
    let files: BTreeMap<&str, String> = package
        .files
        .iter()
        .map(|(name, data)| (name.as_str(), STANDARD.encode(data)))
        .collect();
    json!({ "id": package.manifest.id, "version": package.manifest.version, "files": files })
        .to_string()
        .into_bytes()
}

/// Accepts everything and keeps the payloads
#[derive(Debug, Default)]
pub struct DryRunTransport {
    sent: Mutex<Vec<PublishPayload>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<PublishPayload> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PublishTransport for DryRunTransport {
    async fn publish(&self, payload: PublishPayload) -> Result<TransportResponse, TransportError> {
        let body = json!({
            "pluginId": payload.manifest.id,
            "version": payload.manifest.version,
            "warnings": ["Dry run: nothing was uploaded"],
        });
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(payload);
        Ok(TransportResponse { status: 200, body })
    }
}

#[async_trait]
impl<T: PublishTransport + ?Sized> PublishTransport for Arc<T> {
    async fn publish(&self, payload: PublishPayload) -> Result<TransportResponse, TransportError> {
        (**self).publish(payload).await
    }
}
