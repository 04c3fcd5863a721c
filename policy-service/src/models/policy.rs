//! Desired and remote policy representations.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Longest session the provider accepts (30 days).
pub const MAX_SESSION_DURATION_MINUTES: u32 = 43_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// One access rule, e.g. `{type: "email_domain", value: "@co.com", action: "allow"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Validate)]
pub struct PolicyRule {
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 64, message = "rule type must not be empty"))]
    pub rule_type: String,
    #[validate(custom(function = "validate_rule_value"))]
    pub value: String,
    pub action: RuleAction,
}

impl PolicyRule {
    pub fn new(rule_type: impl Into<String>, value: impl Into<String>, action: RuleAction) -> Self {
        Self {
            rule_type: rule_type.into(),
            value: value.into(),
            action,
        }
    }

    /// Comparison form used when diffing rule sets.
    pub fn normalized(&self) -> (String, String, RuleAction) {
        (
            self.rule_type.trim().to_ascii_lowercase(),
            self.value.trim().to_string(),
            self.action,
        )
    }
}

/// Desired state for one access policy, as submitted by the UI or a CI pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[validate(length(min = 1, max = 255, message = "name must be 1-255 characters"))]
    pub name: String,
    #[validate(custom(function = "validate_domain"))]
    pub domain: String,
    #[serde(default = "default_path")]
    #[validate(custom(function = "validate_path"))]
    pub path: String,
    #[serde(default = "default_session_duration")]
    #[validate(range(min = 1, max = 43200, message = "session duration must be 1-43200 minutes"))]
    pub session_duration_minutes: u32,
    #[serde(default)]
    pub require_mfa: bool,
    #[validate(length(min = 1, message = "at least one rule is required"), nested)]
    pub rules: Vec<PolicyRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_session_duration() -> u32 {
    1440
}

fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    let trimmed = domain.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ValidationError::new("domain_empty"));
    }
    if trimmed.len() > 253 {
        return Err(ValidationError::new("domain_too_long"));
    }
    if trimmed.contains("://") || trimmed.contains('/') {
        return Err(ValidationError::new("domain_has_scheme_or_path"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("domain_has_whitespace"));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    if !trimmed.starts_with('/') {
        return Err(ValidationError::new("path_must_start_with_slash"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("path_has_whitespace"));
    }
    Ok(())
}

fn validate_rule_value(value: &str) -> Result<(), ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("rule_value_empty"));
    }
    if trimmed.len() > 512 {
        return Err(ValidationError::new("rule_value_too_long"));
    }
    Ok(())
}

/// A policy as the provider currently holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePolicy {
    pub provider_id: String,
    pub resource_group_id: String,
    pub name: String,
    pub domain: String,
    pub path: String,
    pub session_duration_minutes: u32,
    pub require_mfa: bool,
    pub rules: Vec<PolicyRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

impl RemotePolicy {
    /// Remote view of `spec` after the provider accepted it.
    pub fn from_spec(provider_id: String, resource_group_id: String, spec: &PolicySpec) -> Self {
        Self {
            provider_id,
            resource_group_id,
            name: spec.name.clone(),
            domain: spec.domain.clone(),
            path: spec.path.clone(),
            session_duration_minutes: spec.session_duration_minutes,
            require_mfa: spec.require_mfa,
            rules: spec.rules.clone(),
            zone_id: spec.zone_id.clone(),
        }
    }
}
