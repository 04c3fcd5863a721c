//! Credential lifecycle: submission, periodic re-validation, status view and
//! tiered expiry notifications.

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use secrecy::Secret;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use super::escalation::{notification_subject, urgency_tier, UrgencyTier};
use super::locks::KeyedLocks;
use super::validator::{CredentialValidation, CredentialValidator};
use crate::models::{
    Credential, CredentialStatus, CredentialStatusView, NotificationState,
};
use crate::services::metrics;
use crate::services::notifier::{CredentialNotice, DegradedNotice, Notifier};
use crate::services::repository::TenantRepository;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub expiring_window: Duration,
    pub degraded_after_failures: u32,
    pub check_concurrency: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            expiring_window: Duration::days(7),
            degraded_after_failures: 3,
            check_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub accepted: bool,
    pub status: CredentialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<Uuid>,
    pub validation: CredentialValidation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Evaluated {
        previous: CredentialStatus,
        current: CredentialStatus,
        notified: Option<UrgencyTier>,
    },
    Unreachable {
        consecutive_failures: u32,
        degraded_signaled: bool,
    },
    Unconfigured,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantCheck {
    pub tenant_id: String,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRunSummary {
    pub checked: usize,
    pub transitions: usize,
    pub notifications_sent: usize,
    pub unreachable: usize,
    pub failures: usize,
}

pub struct CredentialHealthMonitor {
    validator: Arc<CredentialValidator>,
    repository: Arc<dyn TenantRepository>,
    notifier: Arc<dyn Notifier>,
    locks: KeyedLocks,
    config: HealthMonitorConfig,
}

impl CredentialHealthMonitor {
    pub fn new(
        validator: Arc<CredentialValidator>,
        repository: Arc<dyn TenantRepository>,
        notifier: Arc<dyn Notifier>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            validator,
            repository,
            notifier,
            locks: KeyedLocks::new(),
            config,
        }
    }

    /// Validates `secret` and, if it holds every required capability, stores it
    /// in place of the tenant's current credential.
    pub async fn submit_credential(
        &self,
        tenant_id: &str,
        secret: Secret<String>,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, AppError> {
        let validation = self
            .validator
            .validate(&secret, Some(tenant_id))
            .await
            .map_err(|e| AppError::ServiceUnavailable(e.to_string()))?;

        if validation.is_inconclusive() {
            return Err(AppError::ServiceUnavailable(
                "Provider did not answer every permission check; try again".to_string(),
            ));
        }

        if !validation.valid {
            tracing::info!(
                tenant_id = %tenant_id,
                authenticated = validation.authenticated,
                "Credential submission refused"
            );
            return Ok(SubmissionOutcome {
                accepted: false,
                status: CredentialStatus::Invalid,
                credential_id: None,
                validation,
            });
        }

        let _guard = self.locks.acquire(tenant_id).await;

        let mut credential = Credential::new(tenant_id, secret, now);
        apply_validation(&mut credential, &validation, now);
        self.repository.save_credential(&credential).await?;

        let status = credential.status_at(now, self.config.expiring_window);
        let mut state = NotificationState::for_credential(&credential);
        self.maybe_notify(&credential, &mut state, status, now).await;
        state.last_status = status;
        self.repository.save_notification_state(&state).await?;
        metrics::record_status_evaluation(status.as_str());

        tracing::info!(
            tenant_id = %tenant_id,
            credential_id = %credential.id,
            status = status.as_str(),
            "Credential accepted"
        );

        Ok(SubmissionOutcome {
            accepted: true,
            status,
            credential_id: Some(credential.id),
            validation,
        })
    }

    /// Re-validates the tenant's stored credential and applies any transition.
    pub async fn check_tenant(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TenantCheck, AppError> {
        let _guard = self.locks.acquire(tenant_id).await;

        let Some(mut credential) = self.repository.get_credential(tenant_id).await? else {
            return Ok(TenantCheck {
                tenant_id: tenant_id.to_string(),
                outcome: CheckOutcome::Unconfigured,
            });
        };

        let mut state = self
            .repository
            .get_notification_state(credential.id)
            .await?
            .unwrap_or_else(|| NotificationState::for_credential(&credential));
        let previous = state.last_status;

        let validation = match self
            .validator
            .validate(&credential.secret, Some(tenant_id))
            .await
        {
            Ok(v) if v.is_inconclusive() => {
                let detail = format!(
                    "inconclusive capability checks: {:?}",
                    v.permission_report.missing_required()
                );
                return self.record_unreachable(&credential, state, detail).await;
            }
            Ok(v) => v,
            Err(e) => return self.record_unreachable(&credential, state, e.to_string()).await,
        };

        apply_validation(&mut credential, &validation, now);
        self.repository.save_credential(&credential).await?;

        state.consecutive_unreachable = 0;
        state.degraded_signaled = false;

        let current = credential.status_at(now, self.config.expiring_window);
        metrics::record_status_evaluation(current.as_str());
        if current != previous {
            tracing::info!(
                tenant_id = %tenant_id,
                credential_id = %credential.id,
                from = previous.as_str(),
                to = current.as_str(),
                "Credential status changed"
            );
        }

        let notified = self.maybe_notify(&credential, &mut state, current, now).await;
        state.last_status = current;
        self.repository.save_notification_state(&state).await?;

        Ok(TenantCheck {
            tenant_id: tenant_id.to_string(),
            outcome: CheckOutcome::Evaluated {
                previous,
                current,
                notified,
            },
        })
    }

    /// One scheduler tick over every stored credential.
    pub async fn run_scheduled_checks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ScheduledRunSummary, AppError> {
        let tenants: Vec<String> = self
            .repository
            .list_credentials()
            .await?
            .into_iter()
            .map(|c| c.tenant_id)
            .collect();

        tracing::info!(tenants = tenants.len(), "Starting scheduled credential checks");

        let concurrency = self.config.check_concurrency.max(1);
        let results: Vec<(String, Result<TenantCheck, AppError>)> =
            futures::stream::iter(tenants)
                .map(|tenant_id| async move {
                    let result = self.check_tenant(&tenant_id, now).await;
                    (tenant_id, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut summary = ScheduledRunSummary::default();
        for (tenant_id, result) in results {
            summary.checked += 1;
            match result {
                Ok(check) => match check.outcome {
                    CheckOutcome::Evaluated {
                        previous,
                        current,
                        notified,
                    } => {
                        if previous != current {
                            summary.transitions += 1;
                        }
                        if notified.is_some() {
                            summary.notifications_sent += 1;
                        }
                    }
                    CheckOutcome::Unreachable { .. } => summary.unreachable += 1,
                    CheckOutcome::Unconfigured => {}
                },
                Err(e) => {
                    summary.failures += 1;
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Scheduled credential check failed");
                }
            }
        }

        tracing::info!(
            checked = summary.checked,
            transitions = summary.transitions,
            notifications = summary.notifications_sent,
            unreachable = summary.unreachable,
            failures = summary.failures,
            "Scheduled credential checks finished"
        );
        Ok(summary)
    }

    pub async fn credential_status(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CredentialStatusView, AppError> {
        let credential = self.repository.get_credential(tenant_id).await?;
        Ok(self.status_view(tenant_id, credential.as_ref(), now))
    }

    pub fn status_view(
        &self,
        tenant_id: &str,
        credential: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> CredentialStatusView {
        let Some(credential) = credential else {
            return CredentialStatusView {
                tenant_id: tenant_id.to_string(),
                status: CredentialStatus::Unconfigured,
                credential_id: None,
                urgency_tier: None,
                badge: None,
                days_until_expiration: None,
                expires_at: None,
                last_validated_at: None,
                permission_report: None,
                missing_capabilities: Vec::new(),
                resource_groups: Vec::new(),
                report_is_stale: false,
            };
        };

        let status = credential.status_at(now, self.config.expiring_window);
        let days = credential.days_until_expiry(now);
        let tier = notification_tier(status, days);

        CredentialStatusView {
            tenant_id: tenant_id.to_string(),
            status,
            credential_id: Some(credential.id),
            urgency_tier: tier,
            badge: tier.map(|t| t.badge()),
            days_until_expiration: days,
            expires_at: credential.expires_at,
            last_validated_at: credential.last_validated_at,
            permission_report: Some(credential.permission_report.clone()),
            missing_capabilities: credential
                .permission_report
                .missing_required()
                .into_iter()
                .map(String::from)
                .collect(),
            resource_groups: credential.resource_groups.clone(),
            report_is_stale: credential
                .permission_report
                .is_stale_for(self.validator.matrix().version),
        }
    }

    /// Sends at most one notification per tier for the current expiry approach.
    async fn maybe_notify(
        &self,
        credential: &Credential,
        state: &mut NotificationState,
        status: CredentialStatus,
        now: DateTime<Utc>,
    ) -> Option<UrgencyTier> {
        if status == CredentialStatus::Valid {
            state.last_urgency_tier_notified = None;
        }

        let days = credential.days_until_expiry(now);
        let tier = notification_tier(status, days).filter(|t| t.notifies())?;
        if state.last_urgency_tier_notified == Some(tier) {
            return None;
        }

        let notice = CredentialNotice {
            tenant_id: credential.tenant_id.clone(),
            credential_id: credential.id,
            status,
            urgency_tier: tier,
            days_until_expiration: days,
            expires_at: credential.expires_at,
            missing_capabilities: credential
                .permission_report
                .missing_required()
                .into_iter()
                .map(String::from)
                .collect(),
            subject: notification_subject(tier, days),
        };

        match self.notifier.notify(&notice).await {
            Ok(()) => {
                state.last_notification_sent_at = Some(now);
                state.last_urgency_tier_notified = Some(tier);
                metrics::record_notification(tier.as_str());
                tracing::info!(
                    tenant_id = %credential.tenant_id,
                    credential_id = %credential.id,
                    urgency_tier = tier.as_str(),
                    "Credential notification sent"
                );
                Some(tier)
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id = %credential.tenant_id,
                    error = %e,
                    "Credential notification failed; will retry next check"
                );
                None
            }
        }
    }

    async fn record_unreachable(
        &self,
        credential: &Credential,
        mut state: NotificationState,
        error: String,
    ) -> Result<TenantCheck, AppError> {
        state.consecutive_unreachable += 1;
        tracing::warn!(
            tenant_id = %credential.tenant_id,
            consecutive_failures = state.consecutive_unreachable,
            error = %error,
            "Provider unreachable during credential check; status unchanged"
        );

        let mut signaled = false;
        if state.consecutive_unreachable >= self.config.degraded_after_failures
            && !state.degraded_signaled
        {
            let notice = DegradedNotice {
                tenant_id: credential.tenant_id.clone(),
                credential_id: credential.id,
                consecutive_failures: state.consecutive_unreachable,
                last_error: error,
            };
            match self.notifier.health_check_degraded(&notice).await {
                Ok(()) => {
                    state.degraded_signaled = true;
                    signaled = true;
                }
                Err(e) => {
                    tracing::warn!(tenant_id = %credential.tenant_id, error = %e, "Degraded signal failed");
                }
            }
        }

        self.repository.save_notification_state(&state).await?;

        Ok(TenantCheck {
            tenant_id: credential.tenant_id.clone(),
            outcome: CheckOutcome::Unreachable {
                consecutive_failures: state.consecutive_unreachable,
                degraded_signaled: signaled,
            },
        })
    }
}

/// Tier a status warrants, if any.
fn notification_tier(status: CredentialStatus, days: Option<i64>) -> Option<UrgencyTier> {
    match status {
        CredentialStatus::Expired | CredentialStatus::Invalid => Some(UrgencyTier::Critical),
        CredentialStatus::Expiring => Some(urgency_tier(days)),
        CredentialStatus::Valid | CredentialStatus::Unconfigured => None,
    }
}

fn apply_validation(credential: &mut Credential, validation: &CredentialValidation, now: DateTime<Utc>) {
    credential.last_validated_at = Some(now);
    if let Some(token_id) = &validation.provider_token_id {
        credential.provider_token_id = Some(token_id.clone());
    }

    if validation.authenticated {
        credential.rejected_at = None;
        credential.rejection_detail = None;
        credential.permission_report = validation.permission_report.clone();
        credential.expires_at = validation.expires_at;
        if validation.raw_provider_error.is_none() {
            credential.resource_groups = validation.accessible_resource_groups.clone();
        }
    } else if validation.token_expired {
        // Lapsed, not revoked: the expiry date alone drives the status.
        let expired_at = validation.expires_at.map_or(now, |e| e.min(now));
        credential.expires_at = Some(expired_at);
    } else {
        credential.rejected_at.get_or_insert(now);
        credential.rejection_detail = validation.raw_provider_error.clone();
        if validation.expires_at.is_some() {
            credential.expires_at = validation.expires_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_and_invalid_are_critical() {
        assert_eq!(
            notification_tier(CredentialStatus::Expired, Some(-1)),
            Some(UrgencyTier::Critical)
        );
        assert_eq!(
            notification_tier(CredentialStatus::Invalid, Some(30)),
            Some(UrgencyTier::Critical)
        );
    }

    #[test]
    fn expiring_tier_follows_days() {
        assert_eq!(
            notification_tier(CredentialStatus::Expiring, Some(5)),
            Some(UrgencyTier::Medium)
        );
        assert_eq!(
            notification_tier(CredentialStatus::Expiring, Some(1)),
            Some(UrgencyTier::High)
        );
        assert_eq!(notification_tier(CredentialStatus::Valid, Some(3)), None);
    }
}
