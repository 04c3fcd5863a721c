use chrono::{DateTime, Duration, Utc};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::engine::escalation::UrgencyTier;

/// Health of a tenant's stored credential. Always derived from facts, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    #[default]
    Unconfigured,
    Valid,
    Expiring,
    Expired,
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Valid => "valid",
            Self::Expiring => "expiring",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
        }
    }
}

/// Outcome of probing one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityCheck {
    pub granted: bool,
    pub required: bool,
    pub detail: String,
    /// True when the provider could not answer because of a network-class failure.
    #[serde(default)]
    pub inconclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionReport {
    pub matrix_version: u32,
    pub capabilities: BTreeMap<String, CapabilityCheck>,
}

impl PermissionReport {
    pub fn all_required_granted(&self) -> bool {
        self.capabilities
            .values()
            .filter(|c| c.required)
            .all(|c| c.granted)
    }

    pub fn missing_required(&self) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter(|(_, c)| c.required && !c.granted)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn has_inconclusive(&self) -> bool {
        self.capabilities.values().any(|c| c.inconclusive)
    }

    pub fn is_stale_for(&self, current_version: u32) -> bool {
        self.matrix_version < current_version
    }
}

/// Account or zone a credential can act upon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub id: String,
    pub name: String,
}

/// A tenant's provider credential and the facts learned by validating it.
///
/// Submitting a new secret supersedes the record with a fresh `id`; revalidation
/// only refreshes the facts.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub tenant_id: String,
    pub secret: Secret<String>,
    pub provider_token_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_detail: Option<String>,
    pub permission_report: PermissionReport,
    pub resource_groups: Vec<ResourceGroup>,
}

impl Credential {
    pub fn new(tenant_id: impl Into<String>, secret: Secret<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            secret,
            provider_token_id: None,
            created_at: now,
            last_validated_at: None,
            expires_at: None,
            rejected_at: None,
            rejection_detail: None,
            permission_report: PermissionReport::default(),
            resource_groups: Vec::new(),
        }
    }

    /// Status at `now`. An explicit rejection outranks expiry; a missing
    /// permission does not.
    pub fn status_at(&self, now: DateTime<Utc>, expiring_window: Duration) -> CredentialStatus {
        if self.last_validated_at.is_none() {
            return CredentialStatus::Unconfigured;
        }
        if self.rejected_at.is_some() {
            return CredentialStatus::Invalid;
        }
        if self.is_expired_at(now) {
            return CredentialStatus::Expired;
        }
        if !self.permission_report.all_required_granted() {
            return CredentialStatus::Invalid;
        }
        match self.expires_at {
            Some(expires_at) if now >= expires_at - expiring_window => CredentialStatus::Expiring,
            _ => CredentialStatus::Valid,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Whole days until expiry, rounded up while time remains.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|expires_at| days_between(now, expires_at))
    }

    /// Target for newly created policies.
    pub fn primary_resource_group(&self) -> Option<&ResourceGroup> {
        self.resource_groups.iter().min_by(|a, b| a.id.cmp(&b.id))
    }
}

pub fn days_between(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
    let secs = (then - now).num_seconds();
    if secs > 0 {
        (secs + 86_399) / 86_400
    } else {
        secs.div_euclid(86_400)
    }
}

/// Status for a possibly missing credential.
pub fn derive_status(
    credential: Option<&Credential>,
    now: DateTime<Utc>,
    expiring_window: Duration,
) -> CredentialStatus {
    credential
        .map(|c| c.status_at(now, expiring_window))
        .unwrap_or(CredentialStatus::Unconfigured)
}

/// Per-credential notification bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationState {
    pub credential_id: Uuid,
    pub tenant_id: String,
    pub last_notification_sent_at: Option<DateTime<Utc>>,
    pub last_urgency_tier_notified: Option<UrgencyTier>,
    pub last_status: CredentialStatus,
    pub consecutive_unreachable: u32,
    pub degraded_signaled: bool,
}

impl NotificationState {
    pub fn for_credential(credential: &Credential) -> Self {
        Self {
            credential_id: credential.id,
            tenant_id: credential.tenant_id.clone(),
            ..Default::default()
        }
    }
}

/// Read model returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatusView {
    pub tenant_id: String,
    pub status: CredentialStatus,
    pub credential_id: Option<Uuid>,
    pub urgency_tier: Option<UrgencyTier>,
    pub badge: Option<&'static str>,
    pub days_until_expiration: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub permission_report: Option<PermissionReport>,
    pub missing_capabilities: Vec<String>,
    pub resource_groups: Vec<ResourceGroup>,
    pub report_is_stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn granted_report() -> PermissionReport {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(
            "access_apps_write".to_string(),
            CapabilityCheck {
                granted: true,
                required: true,
                detail: "granted".to_string(),
                inconclusive: false,
            },
        );
        capabilities.insert(
            "zone_read".to_string(),
            CapabilityCheck {
                granted: false,
                required: false,
                detail: "missing".to_string(),
                inconclusive: false,
            },
        );
        PermissionReport {
            matrix_version: 1,
            capabilities,
        }
    }

    fn validated(expires_in_days: Option<i64>) -> Credential {
        let mut c = Credential::new("t1", Secret::new("s".to_string()), now());
        c.last_validated_at = Some(now());
        c.expires_at = expires_in_days.map(|d| now() + Duration::days(d));
        c.permission_report = granted_report();
        c
    }

    #[test]
    fn missing_credential_is_unconfigured() {
        assert_eq!(
            derive_status(None, now(), Duration::days(7)),
            CredentialStatus::Unconfigured
        );
    }

    #[test]
    fn never_validated_is_unconfigured() {
        let c = Credential::new("t1", Secret::new("s".to_string()), now());
        assert_eq!(c.status_at(now(), Duration::days(7)), CredentialStatus::Unconfigured);
    }

    #[test]
    fn status_follows_expiry_window() {
        let window = Duration::days(7);
        assert_eq!(validated(None).status_at(now(), window), CredentialStatus::Valid);
        assert_eq!(validated(Some(10)).status_at(now(), window), CredentialStatus::Valid);
        assert_eq!(validated(Some(5)).status_at(now(), window), CredentialStatus::Expiring);
        assert_eq!(validated(Some(0)).status_at(now(), window), CredentialStatus::Expired);
        assert_eq!(validated(Some(-3)).status_at(now(), window), CredentialStatus::Expired);
    }

    #[test]
    fn optional_capability_does_not_invalidate() {
        let c = validated(Some(30));
        assert!(c.permission_report.all_required_granted());
        assert_eq!(c.status_at(now(), Duration::days(7)), CredentialStatus::Valid);
    }

    #[test]
    fn rejection_outranks_expiry() {
        let mut c = validated(Some(30));
        c.rejected_at = Some(now());
        assert_eq!(c.status_at(now(), Duration::days(7)), CredentialStatus::Invalid);

        c.expires_at = Some(now() - Duration::hours(1));
        assert_eq!(c.status_at(now(), Duration::days(7)), CredentialStatus::Invalid);
    }

    #[test]
    fn expiry_outranks_missing_permission() {
        let mut c = validated(Some(-1));
        if let Some(cap) = c.permission_report.capabilities.get_mut("access_apps_write") {
            cap.granted = false;
        }
        assert_eq!(c.status_at(now(), Duration::days(7)), CredentialStatus::Expired);
    }

    #[test]
    fn missing_required_capability_is_invalid() {
        let mut c = validated(Some(30));
        if let Some(cap) = c.permission_report.capabilities.get_mut("access_apps_write") {
            cap.granted = false;
        }
        assert_eq!(c.status_at(now(), Duration::days(7)), CredentialStatus::Invalid);
        assert_eq!(c.permission_report.missing_required(), vec!["access_apps_write"]);
    }

    #[test]
    fn days_round_up_while_time_remains() {
        let n = now();
        assert_eq!(days_between(n, n + Duration::hours(1)), 1);
        assert_eq!(days_between(n, n + Duration::days(5)), 5);
        assert_eq!(days_between(n, n + Duration::days(5) + Duration::minutes(1)), 6);
        assert_eq!(days_between(n, n), 0);
        assert_eq!(days_between(n, n - Duration::hours(1)), -1);
    }

    #[test]
    fn primary_resource_group_is_lowest_id() {
        let mut c = validated(None);
        c.resource_groups = vec![
            ResourceGroup { id: "b".into(), name: "B".into() },
            ResourceGroup { id: "a".into(), name: "A".into() },
        ];
        assert_eq!(c.primary_resource_group().map(|g| g.id.as_str()), Some("a"));
    }
}
