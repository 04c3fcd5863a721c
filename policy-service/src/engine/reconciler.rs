//! Converges remote access policies toward a batch of desired specs.
//!
//! A batch reads the provider's current policies once, then processes items
//! with bounded concurrency. Mutations for the same tenant and identity are
//! serialized through [`KeyedLocks`], and each applied change is written back
//! to the batch snapshot so later items for the same identity see it.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use super::differ::diff_policy;
use super::identity::IdentityKey;
use super::locks::KeyedLocks;
use crate::models::{
    Credential, PolicySpec, ReconcileAction, ReconcileError, ReconcileErrorKind,
    ReconciliationResult, RemotePolicy, ResourceGroup,
};
use crate::services::metrics;
use crate::services::provider::AccessProvider;
use crate::services::repository::TenantRepository;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub max_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub dry_run: bool,
    pub cancel: CancellationToken,
}

impl ReconcileOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }
}

type Snapshot = RwLock<HashMap<IdentityKey, RemotePolicy>>;

/// Per-batch context shared by all items.
struct Batch<'a> {
    tenant_id: &'a str,
    credential: &'a Credential,
    snapshot: Snapshot,
    groups: HashMap<String, ResourceGroup>,
    create_target: Option<ResourceGroup>,
    options: &'a ReconcileOptions,
}

pub struct PolicyReconciler {
    provider: Arc<dyn AccessProvider>,
    repository: Arc<dyn TenantRepository>,
    locks: Arc<KeyedLocks>,
    config: ReconcilerConfig,
}

impl PolicyReconciler {
    pub fn new(
        provider: Arc<dyn AccessProvider>,
        repository: Arc<dyn TenantRepository>,
        locks: Arc<KeyedLocks>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            provider,
            repository,
            locks,
            config,
        }
    }

    /// Returns one result per input spec, in input order.
    pub async fn reconcile(
        &self,
        tenant_id: &str,
        specs: Vec<PolicySpec>,
        options: ReconcileOptions,
    ) -> Vec<ReconciliationResult> {
        let dry_run = options.dry_run;
        tracing::info!(
            tenant_id = %tenant_id,
            items = specs.len(),
            dry_run,
            "Reconciling policy batch"
        );

        let credential = match self.repository.get_credential(tenant_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                return fail_all(
                    &specs,
                    ReconcileError::new(
                        ReconcileErrorKind::CredentialUnavailable,
                        "no provider credential is configured for this tenant",
                    ),
                    dry_run,
                );
            }
            Err(e) => {
                return fail_all(
                    &specs,
                    ReconcileError::new(ReconcileErrorKind::CredentialUnavailable, e.to_string()),
                    dry_run,
                );
            }
        };

        if credential.rejected_at.is_some() {
            let detail = credential
                .rejection_detail
                .clone()
                .unwrap_or_else(|| "credential was rejected by the provider".to_string());
            return fail_all(
                &specs,
                ReconcileError::new(ReconcileErrorKind::CredentialUnavailable, detail),
                dry_run,
            );
        }

        if credential.is_expired_at(chrono::Utc::now()) {
            return fail_all(
                &specs,
                ReconcileError::new(
                    ReconcileErrorKind::CredentialUnavailable,
                    "provider credential has expired",
                ),
                dry_run,
            );
        }

        let batch = match self.load_batch(tenant_id, &credential, &options).await {
            Ok(batch) => batch,
            Err(error) => return fail_all(&specs, error, dry_run),
        };

        let batch_ref = &batch;
        let results: Vec<ReconciliationResult> = futures::stream::iter(specs)
            .map(move |spec| async move { self.reconcile_item(batch_ref, &spec).await })
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for r in &results {
            metrics::record_reconcile_action(r.action.as_str());
        }

        let errors = results.iter().filter(|r| r.is_error()).count();
        tracing::info!(
            tenant_id = %tenant_id,
            items = results.len(),
            errors,
            dry_run,
            "Policy batch reconciled"
        );
        results
    }

    /// Fetches every remote policy the credential can see, once per batch.
    async fn load_batch<'a>(
        &self,
        tenant_id: &'a str,
        credential: &'a Credential,
        options: &'a ReconcileOptions,
    ) -> Result<Batch<'a>, ReconcileError> {
        let mut remote: HashMap<IdentityKey, RemotePolicy> = HashMap::new();
        for group in &credential.resource_groups {
            let policies = self
                .provider
                .list_policies(&credential.secret, group)
                .await
                .map_err(|e| ReconcileError::from(&e))?;

            for policy in policies {
                let key = IdentityKey::for_remote(&policy);
                if let Some(existing) = remote.get(&key) {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        identity_key = %key,
                        kept = %existing.provider_id,
                        ignored = %policy.provider_id,
                        "Duplicate remote policy for identity; keeping the first"
                    );
                    continue;
                }
                remote.insert(key, policy);
            }
        }

        Ok(Batch {
            tenant_id,
            credential,
            snapshot: RwLock::new(remote),
            groups: credential
                .resource_groups
                .iter()
                .map(|g| (g.id.clone(), g.clone()))
                .collect(),
            create_target: credential.primary_resource_group().cloned(),
            options,
        })
    }

    async fn reconcile_item(&self, batch: &Batch<'_>, spec: &PolicySpec) -> ReconciliationResult {
        let identity = IdentityKey::for_spec(spec);
        let dry_run = batch.options.dry_run;

        if let Err(errors) = spec.validate() {
            return ReconciliationResult::failed(
                identity.as_str(),
                ReconcileError::new(ReconcileErrorKind::ValidationRejected, errors.to_string()),
                dry_run,
            );
        }

        if dry_run {
            let snapshot = batch.snapshot.read().await;
            let diff = diff_policy(spec, snapshot.get(&identity));
            return ReconciliationResult {
                identity_key: identity.to_string(),
                action: diff.action,
                diff: diff.changes,
                provider_id: snapshot.get(&identity).map(|r| r.provider_id.clone()),
                error: None,
                dry_run: true,
            };
        }

        let cancel = &batch.options.cancel;
        if cancel.is_cancelled() {
            return ReconciliationResult::failed(identity.as_str(), ReconcileError::cancelled(), false);
        }

        let lock_key = KeyedLocks::key_for(batch.tenant_id, identity.as_str());
        let _guard = tokio::select! {
            guard = self.locks.acquire(&lock_key) => guard,
            _ = cancel.cancelled() => {
                return ReconciliationResult::failed(identity.as_str(), ReconcileError::cancelled(), false);
            }
        };
        if cancel.is_cancelled() {
            return ReconciliationResult::failed(identity.as_str(), ReconcileError::cancelled(), false);
        }

        let current = batch.snapshot.read().await.get(&identity).cloned();
        let diff = diff_policy(spec, current.as_ref());

        let applied = match (diff.action, current.as_ref()) {
            (ReconcileAction::Skip, Some(remote)) => {
                tracing::debug!(identity_key = %identity, "Policy already converged");
                return ReconciliationResult {
                    identity_key: identity.to_string(),
                    action: ReconcileAction::Skip,
                    diff: Vec::new(),
                    provider_id: Some(remote.provider_id.clone()),
                    error: None,
                    dry_run: false,
                };
            }
            (ReconcileAction::Update, Some(remote)) => {
                let Some(group) = batch.groups.get(&remote.resource_group_id) else {
                    return ReconciliationResult::failed(
                        identity.as_str(),
                        ReconcileError::new(
                            ReconcileErrorKind::CredentialUnavailable,
                            format!("resource group {} is not accessible", remote.resource_group_id),
                        ),
                        false,
                    );
                };
                self.provider
                    .update_policy(&batch.credential.secret, group, &remote.provider_id, spec)
                    .await
            }
            _ => {
                let Some(group) = batch.create_target.as_ref() else {
                    return ReconciliationResult::failed(
                        identity.as_str(),
                        ReconcileError::new(
                            ReconcileErrorKind::CredentialUnavailable,
                            "credential has no accessible resource group to create policies in",
                        ),
                        false,
                    );
                };
                self.provider
                    .create_policy(&batch.credential.secret, group, spec)
                    .await
            }
        };

        match applied {
            Ok(remote) => {
                let provider_id = remote.provider_id.clone();
                batch.snapshot.write().await.insert(identity.clone(), remote);
                tracing::info!(
                    tenant_id = %batch.tenant_id,
                    identity_key = %identity,
                    action = diff.action.as_str(),
                    provider_id = %provider_id,
                    "Policy applied"
                );
                ReconciliationResult {
                    identity_key: identity.to_string(),
                    action: diff.action,
                    diff: diff.changes,
                    provider_id: Some(provider_id),
                    error: None,
                    dry_run: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id = %batch.tenant_id,
                    identity_key = %identity,
                    action = diff.action.as_str(),
                    error = %e,
                    "Policy mutation failed"
                );
                ReconciliationResult {
                    identity_key: identity.to_string(),
                    action: ReconcileAction::Error,
                    diff: diff.changes,
                    provider_id: current.map(|r| r.provider_id),
                    error: Some(ReconcileError::from(&e)),
                    dry_run: false,
                }
            }
        }
    }
}

fn fail_all(specs: &[PolicySpec], error: ReconcileError, dry_run: bool) -> Vec<ReconciliationResult> {
    tracing::warn!(error = %error, items = specs.len(), "Policy batch failed before processing");
    specs
        .iter()
        .map(|spec| {
            ReconciliationResult::failed(IdentityKey::for_spec(spec).as_str(), error.clone(), dry_run)
        })
        .collect()
}
