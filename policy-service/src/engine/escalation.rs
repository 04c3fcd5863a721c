//! Maps time-to-expiry onto notification urgency.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyTier {
    Low,
    Medium,
    High,
    Critical,
}

impl UrgencyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Short label for status badges.
    pub fn badge(&self) -> &'static str {
        match self {
            Self::Low => "Expires soon",
            Self::Medium => "Expires this week",
            Self::High => "Expires tomorrow",
            Self::Critical => "Action required",
        }
    }

    pub fn notifies(&self) -> bool {
        *self != Self::Low
    }
}

/// `None` means the credential has no known expiry.
pub fn urgency_tier(days_until_expiration: Option<i64>) -> UrgencyTier {
    match days_until_expiration {
        None => UrgencyTier::Low,
        Some(d) if d <= 0 => UrgencyTier::Critical,
        Some(d) if d <= 1 => UrgencyTier::High,
        Some(d) if d <= 7 => UrgencyTier::Medium,
        Some(_) => UrgencyTier::Low,
    }
}

pub fn notification_subject(tier: UrgencyTier, days_until_expiration: Option<i64>) -> String {
    match (tier, days_until_expiration) {
        (UrgencyTier::Critical, Some(d)) if d <= 0 => {
            "Access provider credential has expired".to_string()
        }
        (UrgencyTier::Critical, _) => "Access provider credential is no longer valid".to_string(),
        (_, Some(1)) => "Access provider credential expires in 1 day".to_string(),
        (_, Some(d)) => format!("Access provider credential expires in {} days", d),
        (_, None) => "Access provider credential needs attention".to_string(),
    }
}
