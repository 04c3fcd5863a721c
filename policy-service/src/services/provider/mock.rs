use super::{AccessProvider, ProviderError, TokenState, TokenVerification};
use crate::engine::capability_matrix::CapabilityMatrix;
use crate::engine::identity::IdentityKey;
use crate::models::{PolicySpec, RemotePolicy, ResourceGroup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MockToken {
    pub id: String,
    pub state: TokenState,
    pub expires_at: Option<DateTime<Utc>>,
    pub grants: HashSet<String>,
}

impl MockToken {
    /// Active token holding every grant in the current capability matrix.
    pub fn fully_granted(id: impl Into<String>) -> Self {
        let grants = CapabilityMatrix::current()
            .capabilities
            .iter()
            .flat_map(|c| c.grants.iter().cloned())
            .collect();
        Self {
            id: id.into(),
            state: TokenState::Active,
            expires_at: None,
            grants,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn without_grant(mut self, grant: &str) -> Self {
        self.grants.remove(grant);
        self
    }
}

#[derive(Default)]
struct MockState {
    tokens: HashMap<String, MockToken>,
    grant_failures: HashMap<String, ProviderError>,
    resource_groups: Vec<ResourceGroup>,
    policies: HashMap<String, Vec<RemotePolicy>>,
    mutation_failures: HashMap<String, ProviderError>,
}

/// In-memory provider for tests and local development.
#[derive(Default)]
pub struct MockAccessProvider {
    state: Mutex<MockState>,
    unreachable: AtomicBool,
    transient_failures: AtomicU32,
    mutation_delay_ms: AtomicU64,
    verify_count: AtomicU64,
    list_count: AtomicU64,
    create_count: AtomicU64,
    update_count: AtomicU64,
    next_id: AtomicU64,
}

impl MockAccessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_token(&self, secret: &str, token: MockToken) {
        self.state().tokens.insert(secret.to_string(), token);
    }

    /// Later calls with this secret are rejected as unauthenticated.
    pub fn revoke_token(&self, secret: &str) {
        self.state().tokens.remove(secret);
    }

    pub fn set_token_state(&self, secret: &str, state: TokenState) {
        if let Some(token) = self.state().tokens.get_mut(secret) {
            token.state = state;
        }
    }

    pub fn set_token_expiry(&self, secret: &str, expires_at: Option<DateTime<Utc>>) {
        if let Some(token) = self.state().tokens.get_mut(secret) {
            token.expires_at = expires_at;
        }
    }

    pub fn remove_grant(&self, secret: &str, grant: &str) {
        if let Some(token) = self.state().tokens.get_mut(secret) {
            token.grants.remove(grant);
        }
    }

    /// Permission checks for `grant` fail with `error` instead of answering.
    pub fn fail_grant(&self, grant: &str, error: ProviderError) {
        self.state().grant_failures.insert(grant.to_string(), error);
    }

    pub fn add_resource_group(&self, id: &str, name: &str) {
        self.state().resource_groups.push(ResourceGroup {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// Seed or overwrite a remote policy, simulating out-of-band drift.
    pub fn put_remote(&self, policy: RemotePolicy) {
        let mut state = self.state();
        let policies = state
            .policies
            .entry(policy.resource_group_id.clone())
            .or_default();
        policies.retain(|p| p.provider_id != policy.provider_id);
        policies.push(policy);
    }

    pub fn remote_policies(&self) -> Vec<RemotePolicy> {
        self.state().policies.values().flatten().cloned().collect()
    }

    /// Mutations for `domain` fail with `error`.
    pub fn fail_mutations_for(&self, domain: &str, error: ProviderError) {
        self.state()
            .mutation_failures
            .insert(domain.trim().to_ascii_lowercase(), error);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `count` calls fail as unreachable, then the provider recovers.
    pub fn fail_next_calls(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_mutation_delay(&self, delay: Duration) {
        self.mutation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn verify_count(&self) -> u64 {
        self.verify_count.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> u64 {
        self.list_count.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> u64 {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), ProviderError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unreachable("mock provider offline".to_string()));
        }
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(ProviderError::Unreachable("mock transient failure".to_string()));
        }
        Ok(())
    }

    fn token(&self, credential: &Secret<String>) -> Result<MockToken, ProviderError> {
        self.state()
            .tokens
            .get(credential.expose_secret())
            .cloned()
            .ok_or_else(|| ProviderError::AuthRejected("Invalid API Token".to_string()))
    }

    fn mutation_failure(&self, spec: &PolicySpec) -> Option<ProviderError> {
        self.state()
            .mutation_failures
            .get(&spec.domain.trim().to_ascii_lowercase())
            .cloned()
    }

    async fn mutation_delay(&self) {
        let ms = self.mutation_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl AccessProvider for MockAccessProvider {
    async fn verify_credential(
        &self,
        credential: &Secret<String>,
    ) -> Result<TokenVerification, ProviderError> {
        self.verify_count.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let token = self.token(credential)?;

        tracing::debug!(token_id = %token.id, "[MOCK] credential verified");

        Ok(TokenVerification {
            token_id: token.id,
            state: token.state,
            expires_at: token.expires_at,
        })
    }

    async fn check_permission(
        &self,
        credential: &Secret<String>,
        _token_id: &str,
        grant: &str,
    ) -> Result<bool, ProviderError> {
        self.check_reachable()?;
        if let Some(err) = self.state().grant_failures.get(grant).cloned() {
            return Err(err);
        }
        let token = self.token(credential)?;
        Ok(token.grants.contains(grant))
    }

    async fn list_resource_groups(
        &self,
        credential: &Secret<String>,
    ) -> Result<Vec<ResourceGroup>, ProviderError> {
        self.check_reachable()?;
        self.token(credential)?;
        Ok(self.state().resource_groups.clone())
    }

    async fn list_policies(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
    ) -> Result<Vec<RemotePolicy>, ProviderError> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.token(credential)?;
        Ok(self
            .state()
            .policies
            .get(&resource_group.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        self.mutation_delay().await;
        self.check_reachable()?;
        self.token(credential)?;
        if let Some(err) = self.mutation_failure(spec) {
            return Err(err);
        }

        let identity = IdentityKey::for_spec(spec);
        let mut state = self.state();
        let policies = state
            .policies
            .entry(resource_group.id.clone())
            .or_default();
        if policies
            .iter()
            .any(|p| IdentityKey::for_remote(p) == identity)
        {
            return Err(ProviderError::Conflict(format!(
                "application for {} already exists",
                identity
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let created =
            RemotePolicy::from_spec(format!("mock-app-{}", id), resource_group.id.clone(), spec);
        policies.push(created.clone());

        tracing::info!(provider_id = %created.provider_id, identity = %identity, "[MOCK] policy created");
        Ok(created)
    }

    async fn update_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        provider_id: &str,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError> {
        self.update_count.fetch_add(1, Ordering::SeqCst);
        self.mutation_delay().await;
        self.check_reachable()?;
        self.token(credential)?;
        if let Some(err) = self.mutation_failure(spec) {
            return Err(err);
        }

        let mut state = self.state();
        let existing = state
            .policies
            .get_mut(&resource_group.id)
            .and_then(|policies| policies.iter_mut().find(|p| p.provider_id == provider_id))
            .ok_or_else(|| {
                ProviderError::Conflict(format!("application {} no longer exists", provider_id))
            })?;

        *existing =
            RemotePolicy::from_spec(provider_id.to_string(), resource_group.id.clone(), spec);

        tracing::info!(provider_id = %provider_id, "[MOCK] policy updated");
        Ok(existing.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicyRule, RuleAction};

    fn spec(domain: &str) -> PolicySpec {
        PolicySpec {
            name: "App".to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
            session_duration_minutes: 60,
            require_mfa: false,
            rules: vec![PolicyRule::new("email", "a@co.com", RuleAction::Allow)],
            zone_id: None,
        }
    }

    fn group() -> ResourceGroup {
        ResourceGroup {
            id: "acct-1".to_string(),
            name: "Main".to_string(),
        }
    }

    #[tokio::test]
    async fn unknown_secret_is_rejected() {
        let provider = MockAccessProvider::new();
        let err = provider
            .verify_credential(&Secret::new("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let provider = MockAccessProvider::new();
        provider.add_token("s", MockToken::fully_granted("tok"));
        let secret = Secret::new("s".to_string());

        provider
            .create_policy(&secret, &group(), &spec("a.example.com"))
            .await
            .unwrap();
        let err = provider
            .create_policy(&secret, &group(), &spec("A.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Conflict(_)));
    }

    #[tokio::test]
    async fn transient_failures_recover() {
        let provider = MockAccessProvider::new();
        provider.add_token("s", MockToken::fully_granted("tok"));
        provider.fail_next_calls(1);
        let secret = Secret::new("s".to_string());

        assert!(provider.verify_credential(&secret).await.is_err());
        assert!(provider.verify_credential(&secret).await.is_ok());
    }
}
