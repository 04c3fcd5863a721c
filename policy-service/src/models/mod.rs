pub mod credential;
pub mod policy;
pub mod reconciliation;

pub use credential::{
    derive_status, CapabilityCheck, Credential, CredentialStatus, CredentialStatusView,
    NotificationState, PermissionReport, ResourceGroup,
};
pub use policy::{PolicyRule, PolicySpec, RemotePolicy, RuleAction};
pub use reconciliation::{
    FieldChange, ReconcileAction, ReconcileError, ReconcileErrorKind, ReconcileSummary,
    ReconciliationResult,
};
