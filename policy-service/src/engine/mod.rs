pub mod capability_matrix;
pub mod differ;
pub mod escalation;
pub mod health_monitor;
pub mod identity;
pub mod locks;
pub mod reconciler;
pub mod validator;
