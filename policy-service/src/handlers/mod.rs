pub mod credentials;
pub mod health;
pub mod jobs;
pub mod policies;

pub use credentials::{credential_status, revalidate_credential, submit_credential};
pub use health::{health_check, metrics_endpoint, readiness_check};
pub use jobs::run_credential_health;
pub use policies::{bulk_reconcile, check_policy, upsert_policy};
