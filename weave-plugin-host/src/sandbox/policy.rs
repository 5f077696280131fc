//! Install-time permission policy
//!
//! The policy splits a manifest's requested permissions into those granted
//! outright, those that need a user's confirmation, and those never granted.
//! The outcome is fixed for the life of the loaded plugin.

use serde::{Deserialize, Serialize};
use weave_plugin_api::{PermissionSet, PluginManifest, PluginPermission};

use super::checker::GrantedPermissions;
use super::confirm::{ConfirmationHandler, ConfirmationRequest, ConfirmationResult};
use super::store::{GrantStore, StoredGrant};
use crate::audit::PermissionAuditor;

/// Declarative allow and deny lists
///
/// Entries are permission names or `prefix.*` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPolicy {
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    /// Dangerous permissions need confirmation even when allow-listed
    pub require_confirmation: bool,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            allowed: vec!["storage".into(), "ui.*".into()],
            denied: vec!["shell".into()],
            require_confirmation: true,
        }
    }
}

impl PermissionPolicy {
    /// Grants whatever is not denied, without asking
    pub fn permissive() -> Self {
        Self {
            allowed: vec!["*".into()],
            denied: Vec::new(),
            require_confirmation: false,
        }
    }

    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.allowed.push(pattern.into());
        self
    }

    pub fn deny(mut self, pattern: impl Into<String>) -> Self {
        self.denied.push(pattern.into());
        self
    }

    fn is_denied(&self, permission: PluginPermission) -> bool {
        self.denied.iter().any(|p| permission.matches_pattern(p))
    }

    fn is_allowed(&self, permission: PluginPermission) -> bool {
        self.allowed.iter().any(|p| permission.matches_pattern(p))
    }
}

/// How a manifest's request was split by the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEvaluation {
    pub plugin_id: String,
    pub plugin_name: String,
    pub requested: PermissionSet,
    pub auto_granted: Vec<PluginPermission>,
    pub requires_approval: Vec<PluginPermission>,
    pub denied: Vec<PluginPermission>,
}

/// Final grant plus how it was reached
#[derive(Debug, Clone)]
pub struct Resolution {
    pub granted: GrantedPermissions,
    /// `None` when nothing needed confirmation
    pub confirmation: Option<ConfirmationResult>,
}

impl Resolution {
    /// Whether the grant may be remembered for later loads
    pub fn should_persist(&self) -> bool {
        self.confirmation.map_or(true, |c| c.should_persist())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyChecker {
    policy: PermissionPolicy,
}

impl PolicyChecker {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    pub fn evaluate(&self, manifest: &PluginManifest) -> PolicyEvaluation {
        let mut evaluation = PolicyEvaluation {
            plugin_id: manifest.id.clone(),
            plugin_name: manifest.name.clone(),
            requested: manifest.permissions.clone(),
            auto_granted: Vec::new(),
            requires_approval: Vec::new(),
            denied: Vec::new(),
        };

        for permission in manifest.permissions.iter() {
            if self.policy.is_denied(permission) {
                evaluation.denied.push(permission);
            } else if self.policy.is_allowed(permission)
                && !(permission.is_dangerous() && self.policy.require_confirmation)
            {
                evaluation.auto_granted.push(permission);
            } else {
                evaluation.requires_approval.push(permission);
            }
        }

        evaluation
    }

    /// Grant auto-approved permissions plus whatever the handler confirms
    pub fn resolve(&self, evaluation: &PolicyEvaluation, handler: &dyn ConfirmationHandler) -> GrantedPermissions {
        self.resolve_with(evaluation, handler, false).granted
    }

    pub fn resolve_with(
        &self,
        evaluation: &PolicyEvaluation,
        handler: &dyn ConfirmationHandler,
        escalation: bool,
    ) -> Resolution {
        let mut granted: PermissionSet = evaluation.auto_granted.iter().copied().collect();

        if evaluation.requires_approval.is_empty() {
            return Resolution {
                granted: GrantedPermissions::new(granted),
                confirmation: None,
            };
        }

        let request = ConfirmationRequest {
            plugin_id: evaluation.plugin_id.clone(),
            plugin_name: evaluation.plugin_name.clone(),
            permissions: evaluation.requires_approval.clone(),
            escalation,
        };

        let result = match handler.confirm(&request) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    plugin = %evaluation.plugin_id,
                    error = %e,
                    "Permission confirmation failed, denying"
                );
                ConfirmationResult::Deny
            }
        };

        if result.is_approved() {
            for permission in &evaluation.requires_approval {
                granted.insert(*permission);
            }
        }

        Resolution {
            granted: GrantedPermissions::new(granted),
            confirmation: Some(result),
        }
    }
}

/// Grants for one load, plus the record to persist once the plugin runs
#[derive(Debug, Clone)]
pub struct GrantDecision {
    pub granted: GrantedPermissions,
    pending: Option<StoredGrant>,
}

impl GrantDecision {
    /// Whether [`commit`](Self::commit) would write to the store
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Write the remembered grant; store failures are logged
    pub fn commit(&self, plugin_id: &str, store: &dyn GrantStore) {
        let Some(grant) = &self.pending else {
            return;
        };
        match store.set(plugin_id, grant.clone()) {
            Ok(()) => tracing::debug!(plugin = %plugin_id, "Grant stored"),
            Err(e) => tracing::warn!(plugin = %plugin_id, error = %e, "Failed to store grant"),
        }
    }
}

/// Decide a manifest's grants without touching the store
///
/// A stored, unexpired grant for the same permission set is reused. Anything
/// else goes through the policy and, when needed, the confirmation handler.
/// A stored grant whose permission hash differs from the request is an
/// escalation: it is audited and the user is asked again.
///
/// The handler may block, so async callers run this on a blocking thread.
pub fn decide_grants(
    manifest: &PluginManifest,
    checker: &PolicyChecker,
    handler: &dyn ConfirmationHandler,
    store: &dyn GrantStore,
    auditor: &PermissionAuditor,
) -> GrantDecision {
    let evaluation = checker.evaluate(manifest);

    let stored = match store.get(&manifest.id) {
        Ok(stored) => stored,
        Err(e) => {
            tracing::warn!(plugin = %manifest.id, error = %e, "Failed to read stored grant");
            None
        }
    };

    let mut escalation = false;
    if let Some(stored) = stored.filter(|s| !s.is_expired(chrono::Utc::now())) {
        if !stored.has_escalated(&manifest.permissions) {
            // The policy may have tightened since the grant was stored
            let granted: GrantedPermissions = stored
                .permissions
                .iter()
                .filter(|p| !evaluation.denied.contains(p))
                .collect();
            tracing::debug!(plugin = %manifest.id, count = granted.len(), "Using stored grant");
            return GrantDecision { granted, pending: None };
        }

        escalation = true;
        let new_hash = manifest.permissions.compute_hash();
        tracing::warn!(plugin = %manifest.id, "Permission escalation detected");
        auditor.escalation(&manifest.id, &stored.permissions_hash, &new_hash);
    }

    let resolution = checker.resolve_with(&evaluation, handler, escalation);

    let actor = match resolution.confirmation {
        Some(_) => "user",
        None => "policy",
    };
    for permission in resolution.granted.iter() {
        auditor.grant(&manifest.id, permission, actor);
    }
    for permission in &evaluation.denied {
        auditor.denied(&manifest.id, *permission, "denied by policy");
    }
    for permission in &evaluation.requires_approval {
        if !resolution.granted.contains(*permission) {
            auditor.denied(&manifest.id, *permission, "not confirmed");
        }
    }

    let pending = resolution
        .should_persist()
        .then(|| StoredGrant::new(&manifest.permissions, resolution.granted.as_set().clone()));

    tracing::info!(
        plugin = %manifest.id,
        granted = resolution.granted.len(),
        denied = evaluation.denied.len(),
        "Permissions resolved"
    );

    GrantDecision {
        granted: resolution.granted,
        pending,
    }
}

/// [`decide_grants`] and commit the result straight away
pub fn resolve_grants(
    manifest: &PluginManifest,
    checker: &PolicyChecker,
    handler: &dyn ConfirmationHandler,
    store: &dyn GrantStore,
    auditor: &PermissionAuditor,
) -> GrantedPermissions {
    let decision = decide_grants(manifest, checker, handler, store, auditor);
    decision.commit(&manifest.id, store);
    decision.granted
}
