pub mod cloudflare;
pub mod mock;
pub mod retrying;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use service_core::retry::RetryClass;
use std::time::Duration;
use thiserror::Error;

use crate::models::{PolicySpec, RemotePolicy, ResourceGroup};

pub use cloudflare::CloudflareAccessProvider;
pub use mock::MockAccessProvider;
pub use retrying::RetryingProvider;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Validation rejected: {0}")]
    ValidationRejected(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unexpected provider response: {0}")]
    Unexpected(String),
}

impl RetryClass for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Unreachable(format!("{} timed out after {}ms", operation, after.as_millis()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Active,
    Disabled,
    Expired,
}

/// What the provider reports about a credential it recognises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenVerification {
    pub token_id: String,
    pub state: TokenState,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Remote Zero Trust access API.
///
/// Implementations return raw outcomes; retrying transient failures is the job
/// of [`RetryingProvider`].
#[async_trait]
pub trait AccessProvider: Send + Sync {
    async fn verify_credential(
        &self,
        credential: &Secret<String>,
    ) -> Result<TokenVerification, ProviderError>;

    /// Whether the credential holds `grant`, a provider permission group name.
    async fn check_permission(
        &self,
        credential: &Secret<String>,
        token_id: &str,
        grant: &str,
    ) -> Result<bool, ProviderError>;

    async fn list_resource_groups(
        &self,
        credential: &Secret<String>,
    ) -> Result<Vec<ResourceGroup>, ProviderError>;

    async fn list_policies(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
    ) -> Result<Vec<RemotePolicy>, ProviderError>;

    async fn create_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError>;

    async fn update_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        provider_id: &str,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_class_errors_are_transient() {
        assert!(ProviderError::Unreachable("x".into()).is_transient());
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(!ProviderError::AuthRejected("x".into()).is_transient());
        assert!(!ProviderError::ValidationRejected("x".into()).is_transient());
        assert!(!ProviderError::Conflict("x".into()).is_transient());
    }

    #[test]
    fn rate_limit_exposes_retry_after() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }
}
