pub mod metrics;
pub mod notifier;
pub mod provider;
pub mod repository;

pub use metrics::{get_metrics, init_metrics};
