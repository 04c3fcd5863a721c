use super::{AccessProvider, ProviderError, TokenVerification};
use crate::models::{PolicySpec, RemotePolicy, ResourceGroup};
use crate::services::metrics;
use async_trait::async_trait;
use secrecy::Secret;
use service_core::retry::{retry_call, RetryConfig};
use std::sync::Arc;

/// Applies retry with backoff to every call of the wrapped provider.
pub struct RetryingProvider {
    inner: Arc<dyn AccessProvider>,
    config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn AccessProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

fn observe<T>(operation: &str, result: Result<T, ProviderError>) -> Result<T, ProviderError> {
    let outcome = match &result {
        Ok(_) => "success",
        Err(ProviderError::AuthRejected(_)) => "auth_rejected",
        Err(ProviderError::PermissionDenied(_)) => "permission_denied",
        Err(ProviderError::Unreachable(_)) => "unreachable",
        Err(ProviderError::RateLimited { .. }) => "rate_limited",
        Err(ProviderError::ValidationRejected(_)) => "validation_rejected",
        Err(ProviderError::Conflict(_)) => "conflict",
        Err(ProviderError::Unexpected(_)) => "unexpected",
    };
    metrics::record_provider_call(operation, outcome);
    result
}

#[async_trait]
impl AccessProvider for RetryingProvider {
    async fn verify_credential(
        &self,
        credential: &Secret<String>,
    ) -> Result<TokenVerification, ProviderError> {
        let result = retry_call(&self.config, "verify_credential", move || {
            self.inner.verify_credential(credential)
        })
        .await;
        observe("verify_credential", result)
    }

    async fn check_permission(
        &self,
        credential: &Secret<String>,
        token_id: &str,
        grant: &str,
    ) -> Result<bool, ProviderError> {
        let result = retry_call(&self.config, "check_permission", move || {
            self.inner.check_permission(credential, token_id, grant)
        })
        .await;
        observe("check_permission", result)
    }

    async fn list_resource_groups(
        &self,
        credential: &Secret<String>,
    ) -> Result<Vec<ResourceGroup>, ProviderError> {
        let result = retry_call(&self.config, "list_resource_groups", move || {
            self.inner.list_resource_groups(credential)
        })
        .await;
        observe("list_resource_groups", result)
    }

    async fn list_policies(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
    ) -> Result<Vec<RemotePolicy>, ProviderError> {
        let result = retry_call(&self.config, "list_policies", move || {
            self.inner.list_policies(credential, resource_group)
        })
        .await;
        observe("list_policies", result)
    }

    async fn create_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError> {
        let result = retry_call(&self.config, "create_policy", move || {
            self.inner.create_policy(credential, resource_group, spec)
        })
        .await;
        observe("create_policy", result)
    }

    async fn update_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        provider_id: &str,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError> {
        let result = retry_call(&self.config, "update_policy", move || {
            self.inner
                .update_policy(credential, resource_group, provider_id, spec)
        })
        .await;
        observe("update_policy", result)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
