use serde::{Deserialize, Serialize};
use std::fmt;

use crate::services::provider::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileAction {
    Create,
    Update,
    Skip,
    Error,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Skip => "skip",
            Self::Error => "error",
        }
    }
}

/// One field that differs between desired and remote state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileErrorKind {
    AuthRejected,
    PermissionDenied,
    ProviderUnreachable,
    RateLimited,
    ValidationRejected,
    ConflictDuringMutation,
    CredentialUnavailable,
    ProviderError,
    Cancelled,
}

/// Failure attached to a single reconciliation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileError {
    pub kind: ReconcileErrorKind,
    pub message: String,
}

impl ReconcileError {
    pub fn new(kind: ReconcileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ReconcileErrorKind::Cancelled, "batch cancelled before this item started")
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&ProviderError> for ReconcileError {
    fn from(err: &ProviderError) -> Self {
        let kind = match err {
            ProviderError::AuthRejected(_) => ReconcileErrorKind::AuthRejected,
            ProviderError::PermissionDenied(_) => ReconcileErrorKind::PermissionDenied,
            ProviderError::Unreachable(_) => ReconcileErrorKind::ProviderUnreachable,
            ProviderError::RateLimited { .. } => ReconcileErrorKind::RateLimited,
            ProviderError::ValidationRejected(_) => ReconcileErrorKind::ValidationRejected,
            ProviderError::Conflict(_) => ReconcileErrorKind::ConflictDuringMutation,
            ProviderError::Unexpected(_) => ReconcileErrorKind::ProviderError,
        };
        Self::new(kind, err.to_string())
    }
}

/// Per-item outcome of a reconciliation batch, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub identity_key: String,
    pub action: ReconcileAction,
    pub diff: Vec<FieldChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReconcileError>,
    pub dry_run: bool,
}

impl ReconciliationResult {
    pub fn failed(identity_key: impl Into<String>, error: ReconcileError, dry_run: bool) -> Self {
        Self {
            identity_key: identity_key.into(),
            action: ReconcileAction::Error,
            diff: Vec::new(),
            provider_id: None,
            error: Some(error),
            dry_run,
        }
    }

    pub fn is_error(&self) -> bool {
        self.action == ReconcileAction::Error
    }
}

/// Counts by action, returned alongside bulk results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileSummary {
    pub fn from_results(results: &[ReconciliationResult]) -> Self {
        results.iter().fold(
            Self {
                total: results.len(),
                ..Default::default()
            },
            |mut acc, r| {
                match r.action {
                    ReconcileAction::Create => acc.created += 1,
                    ReconcileAction::Update => acc.updated += 1,
                    ReconcileAction::Skip => acc.skipped += 1,
                    ReconcileAction::Error => acc.failed += 1,
                }
                acc
            },
        )
    }
}
