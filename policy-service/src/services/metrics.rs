//! Metrics collection for policy-service.
//!
//! HTTP metrics go through the `metrics` facade; domain counters live in a
//! Prometheus registry. Recording is a no-op until [`init_metrics`] runs.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static RECONCILIATION_ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static STATUS_EVALUATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static PROVIDER_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help), labels)
}

/// Initialize metrics collection. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);

    let registry = Registry::new();

    let actions = counter(
        "policy_reconciliation_actions_total",
        "Reconciliation results by action",
        &["action"],
    )?;
    let evaluations = counter(
        "credential_status_evaluations_total",
        "Credential status evaluations by resulting status",
        &["status"],
    )?;
    let provider_calls = counter(
        "provider_calls_total",
        "Access provider calls by operation and outcome",
        &["operation", "outcome"],
    )?;
    let notifications = counter(
        "credential_notifications_total",
        "Credential notifications sent by urgency tier",
        &["tier"],
    )?;

    registry.register(Box::new(actions.clone()))?;
    registry.register(Box::new(evaluations.clone()))?;
    registry.register(Box::new(provider_calls.clone()))?;
    registry.register(Box::new(notifications.clone()))?;

    let _ = PROMETHEUS_REGISTRY.set(registry);
    let _ = RECONCILIATION_ACTIONS_TOTAL.set(actions);
    let _ = STATUS_EVALUATIONS_TOTAL.set(evaluations);
    let _ = PROVIDER_CALLS_TOTAL.set(provider_calls);
    let _ = NOTIFICATIONS_TOTAL.set(notifications);

    Ok(())
}

/// Get metrics output in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_reconcile_action(action: &str) {
    if let Some(counter) = RECONCILIATION_ACTIONS_TOTAL.get() {
        counter.with_label_values(&[action]).inc();
    }
}

pub fn record_status_evaluation(status: &str) {
    if let Some(counter) = STATUS_EVALUATIONS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_provider_call(operation: &str, outcome: &str) {
    if let Some(counter) = PROVIDER_CALLS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

pub fn record_notification(tier: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[tier]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_before_init_is_a_no_op() {
        record_reconcile_action("create");
        record_provider_call("verify_credential", "success");
    }
}
