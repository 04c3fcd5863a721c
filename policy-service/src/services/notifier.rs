//! Outbound credential notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::escalation::UrgencyTier;
use crate::models::CredentialStatus;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialNotice {
    pub tenant_id: String,
    pub credential_id: Uuid,
    pub status: CredentialStatus,
    pub urgency_tier: UrgencyTier,
    pub days_until_expiration: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub missing_capabilities: Vec<String>,
    pub subject: String,
}

/// Raised when the provider has been unreachable for several checks in a row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedNotice {
    pub tenant_id: String,
    pub credential_id: Uuid,
    pub consecutive_failures: u32,
    pub last_error: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &CredentialNotice) -> Result<(), NotifyError>;

    async fn health_check_degraded(&self, notice: &DegradedNotice) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notice: &CredentialNotice) -> Result<(), NotifyError> {
        tracing::warn!(
            tenant_id = %notice.tenant_id,
            credential_id = %notice.credential_id,
            status = notice.status.as_str(),
            urgency_tier = notice.urgency_tier.as_str(),
            days_until_expiration = ?notice.days_until_expiration,
            subject = %notice.subject,
            "Credential notification"
        );
        Ok(())
    }

    async fn health_check_degraded(&self, notice: &DegradedNotice) -> Result<(), NotifyError> {
        tracing::error!(
            tenant_id = %notice.tenant_id,
            credential_id = %notice.credential_id,
            consecutive_failures = notice.consecutive_failures,
            last_error = %notice.last_error,
            "Credential health checks degraded"
        );
        Ok(())
    }
}

/// Posts notifications as JSON to an operator webhook.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

#[derive(Serialize)]
struct WebhookPayload<'a, T: Serialize> {
    event: &'static str,
    data: &'a T,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn post<T: Serialize + Sync>(&self, event: &'static str, data: &T) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { event, data })
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "Webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &CredentialNotice) -> Result<(), NotifyError> {
        self.post("credential.notification", notice).await
    }

    async fn health_check_degraded(&self, notice: &DegradedNotice) -> Result<(), NotifyError> {
        self.post("credential.health_check_degraded", notice).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedNotice {
    Credential(CredentialNotice),
    Degraded(DegradedNotice),
}

/// Records notifications for assertions in tests.
#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<RecordedNotice>>,
    fail: AtomicBool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<RecordedNotice> {
        self.sent
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn credential_notices(&self) -> Vec<CredentialNotice> {
        self.sent()
            .into_iter()
            .filter_map(|n| match n {
                RecordedNotice::Credential(c) => Some(c),
                RecordedNotice::Degraded(_) => None,
            })
            .collect()
    }

    pub fn degraded_notices(&self) -> Vec<DegradedNotice> {
        self.sent()
            .into_iter()
            .filter_map(|n| match n {
                RecordedNotice::Degraded(d) => Some(d),
                RecordedNotice::Credential(_) => None,
            })
            .collect()
    }

    fn record(&self, notice: RecordedNotice) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Delivery("mock notifier failing".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notice);
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, notice: &CredentialNotice) -> Result<(), NotifyError> {
        self.record(RecordedNotice::Credential(notice.clone()))
    }

    async fn health_check_degraded(&self, notice: &DegradedNotice) -> Result<(), NotifyError> {
        self.record(RecordedNotice::Degraded(notice.clone()))
    }
}
