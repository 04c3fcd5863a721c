//! Probes a credential against the provider and the capability matrix.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use secrecy::Secret;
use serde::Serialize;
use service_core::retry::RetryClass;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::capability_matrix::{Capability, CapabilityMatrix};
use crate::models::{CapabilityCheck, PermissionReport, ResourceGroup};
use crate::services::provider::{AccessProvider, ProviderError, TokenState, TokenVerification};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialValidation {
    pub authenticated: bool,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_token_id: Option<String>,
    pub permission_report: PermissionReport,
    pub accessible_resource_groups: Vec<ResourceGroup>,
    pub expires_at: Option<DateTime<Utc>>,
    /// The provider recognised the token but reports it past its expiry.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub token_expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_provider_error: Option<String>,
}

impl CredentialValidation {
    fn rejected(matrix_version: u32, detail: String) -> Self {
        Self {
            authenticated: false,
            valid: false,
            provider_token_id: None,
            permission_report: PermissionReport {
                matrix_version,
                capabilities: BTreeMap::new(),
            },
            accessible_resource_groups: Vec::new(),
            expires_at: None,
            token_expired: false,
            raw_provider_error: Some(detail),
        }
    }

    /// Not valid only because some capability probe could not reach the provider.
    pub fn is_inconclusive(&self) -> bool {
        self.authenticated && !self.valid && self.permission_report.has_inconclusive()
    }
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("Provider unreachable: {0}")]
    ProviderUnreachable(String),
}

pub struct CredentialValidator {
    provider: Arc<dyn AccessProvider>,
    matrix: Arc<CapabilityMatrix>,
}

impl CredentialValidator {
    pub fn new(provider: Arc<dyn AccessProvider>, matrix: Arc<CapabilityMatrix>) -> Self {
        Self { provider, matrix }
    }

    pub fn matrix(&self) -> &CapabilityMatrix {
        &self.matrix
    }

    /// Only an explicit rejection yields `authenticated = false`; network-class
    /// failures while verifying surface as [`ValidatorError::ProviderUnreachable`].
    pub async fn validate(
        &self,
        credential: &Secret<String>,
        tenant_id: Option<&str>,
    ) -> Result<CredentialValidation, ValidatorError> {
        let tenant = tenant_id.unwrap_or("-");

        let verification = match self.provider.verify_credential(credential).await {
            Ok(v) => v,
            Err(ProviderError::AuthRejected(detail)) => {
                tracing::warn!(tenant_id = %tenant, detail = %detail, "Credential rejected by provider");
                return Ok(CredentialValidation::rejected(self.matrix.version, detail));
            }
            Err(e) => {
                tracing::warn!(tenant_id = %tenant, error = %e, "Credential verification could not complete");
                return Err(ValidatorError::ProviderUnreachable(e.to_string()));
            }
        };

        if verification.state != TokenState::Active {
            let detail = format!("token is {:?}", verification.state).to_lowercase();
            tracing::warn!(tenant_id = %tenant, detail = %detail, "Credential is not active");
            let mut rejected = CredentialValidation::rejected(self.matrix.version, detail);
            rejected.provider_token_id = Some(verification.token_id);
            rejected.expires_at = verification.expires_at;
            rejected.token_expired = verification.state == TokenState::Expired;
            return Ok(rejected);
        }

        let checks = join_all(
            self.matrix
                .capabilities
                .iter()
                .map(|capability| self.check_capability(credential, &verification, capability)),
        )
        .await;

        let permission_report = PermissionReport {
            matrix_version: self.matrix.version,
            capabilities: self
                .matrix
                .capabilities
                .iter()
                .map(|c| c.name.clone())
                .zip(checks)
                .collect(),
        };

        let (mut accessible_resource_groups, raw_provider_error) =
            match self.provider.list_resource_groups(credential).await {
                Ok(groups) => (groups, None),
                Err(e) if e.is_transient() => {
                    return Err(ValidatorError::ProviderUnreachable(e.to_string()));
                }
                Err(e) => (Vec::new(), Some(e.to_string())),
            };
        accessible_resource_groups.sort_by(|a, b| a.id.cmp(&b.id));

        let valid = permission_report.all_required_granted();

        tracing::info!(
            tenant_id = %tenant,
            token_id = %verification.token_id,
            valid,
            missing = ?permission_report.missing_required(),
            resource_groups = accessible_resource_groups.len(),
            "Credential validated"
        );

        Ok(CredentialValidation {
            authenticated: true,
            valid,
            provider_token_id: Some(verification.token_id),
            permission_report,
            accessible_resource_groups,
            expires_at: verification.expires_at,
            token_expired: false,
            raw_provider_error,
        })
    }

    /// A failing probe yields `granted = false` and never aborts the others.
    async fn check_capability(
        &self,
        credential: &Secret<String>,
        verification: &TokenVerification,
        capability: &Capability,
    ) -> CapabilityCheck {
        let mut errors = Vec::new();
        let mut inconclusive = false;

        for grant in &capability.grants {
            match self
                .provider
                .check_permission(credential, &verification.token_id, grant)
                .await
            {
                Ok(true) => {
                    return CapabilityCheck {
                        granted: true,
                        required: capability.required,
                        detail: format!("granted via \"{}\"", grant),
                        inconclusive: false,
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    inconclusive |= e.is_transient();
                    errors.push(e.to_string());
                }
            }
        }

        let detail = if errors.is_empty() {
            format!("missing grant: {}", capability.grants.join(" or "))
        } else {
            format!("check failed: {}", errors.join("; "))
        };

        CapabilityCheck {
            granted: false,
            required: capability.required,
            detail,
            inconclusive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::provider::mock::{MockAccessProvider, MockToken};

    fn setup() -> (Arc<MockAccessProvider>, CredentialValidator) {
        let mock = Arc::new(MockAccessProvider::new());
        mock.add_resource_group("acct-b", "Beta");
        mock.add_resource_group("acct-a", "Alpha");
        let validator = CredentialValidator::new(mock.clone(), Arc::new(CapabilityMatrix::current()));
        (mock, validator)
    }

    fn secret() -> Secret<String> {
        Secret::new("token".to_string())
    }

    #[tokio::test]
    async fn fully_granted_credential_is_valid() {
        let (mock, validator) = setup();
        mock.add_token("token", MockToken::fully_granted("tok-1"));

        let v = validator.validate(&secret(), Some("t1")).await.unwrap();
        assert!(v.authenticated);
        assert!(v.valid);
        assert_eq!(v.permission_report.matrix_version, CapabilityMatrix::CURRENT_VERSION);
        assert_eq!(v.accessible_resource_groups[0].id, "acct-a");
    }

    #[tokio::test]
    async fn rejected_credential_is_not_authenticated() {
        let (_mock, validator) = setup();
        let v = validator.validate(&secret(), None).await.unwrap();
        assert!(!v.authenticated);
        assert!(!v.valid);
        assert!(v.raw_provider_error.is_some());
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_error() {
        let (mock, validator) = setup();
        mock.add_token("token", MockToken::fully_granted("tok-1"));
        mock.set_unreachable(true);
        assert!(matches!(
            validator.validate(&secret(), None).await,
            Err(ValidatorError::ProviderUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn missing_optional_capability_keeps_credential_valid() {
        let (mock, validator) = setup();
        mock.add_token(
            "token",
            MockToken::fully_granted("tok-1")
                .without_grant("Zone Read")
                .without_grant("Zone Write"),
        );

        let v = validator.validate(&secret(), None).await.unwrap();
        assert!(v.valid);
        assert!(!v.permission_report.capabilities["zone_read"].granted);
    }

    #[tokio::test]
    async fn one_failing_probe_does_not_hide_the_others() {
        let (mock, validator) = setup();
        mock.add_token("token", MockToken::fully_granted("tok-1"));
        mock.fail_grant(
            "Access: Audit Logs Read",
            ProviderError::PermissionDenied("no".into()),
        );

        let v = validator.validate(&secret(), None).await.unwrap();
        let audit = &v.permission_report.capabilities["access_audit_logs_read"];
        assert!(!audit.granted);
        assert!(audit.detail.contains("check failed"));
        assert!(v.permission_report.capabilities["access_apps_write"].granted);
        assert!(v.valid);
    }

    #[tokio::test]
    async fn missing_required_capability_is_invalid() {
        let (mock, validator) = setup();
        mock.add_token(
            "token",
            MockToken::fully_granted("tok-1").without_grant("Access: Apps and Policies Write"),
        );

        let v = validator.validate(&secret(), None).await.unwrap();
        assert!(v.authenticated);
        assert!(!v.valid);
        assert!(!v.is_inconclusive());
    }
}
