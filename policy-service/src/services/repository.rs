//! Tenant credential and notification-state storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Credential, NotificationState};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        AppError::ServiceUnavailable(err.to_string())
    }
}

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn get_credential(&self, tenant_id: &str) -> Result<Option<Credential>, RepositoryError>;

    /// Stores `credential` as the tenant's current one. A different `id`
    /// supersedes the previous credential; the same `id` refreshes its facts.
    async fn save_credential(&self, credential: &Credential) -> Result<(), RepositoryError>;

    async fn list_credentials(&self) -> Result<Vec<Credential>, RepositoryError>;

    async fn get_notification_state(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<NotificationState>, RepositoryError>;

    async fn save_notification_state(&self, state: &NotificationState) -> Result<(), RepositoryError>;
}

/// Superseded credential, kept for audit.
#[derive(Debug, Clone)]
pub struct SupersededCredential {
    pub credential_id: Uuid,
    pub superseded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryTenantStore {
    credentials: DashMap<String, Credential>,
    history: DashMap<String, Vec<SupersededCredential>>,
    notification_states: DashMap<Uuid, NotificationState>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn superseded(&self, tenant_id: &str) -> Vec<SupersededCredential> {
        self.history
            .get(tenant_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TenantRepository for InMemoryTenantStore {
    async fn get_credential(&self, tenant_id: &str) -> Result<Option<Credential>, RepositoryError> {
        Ok(self.credentials.get(tenant_id).map(|c| c.clone()))
    }

    async fn save_credential(&self, credential: &Credential) -> Result<(), RepositoryError> {
        let previous = self
            .credentials
            .insert(credential.tenant_id.clone(), credential.clone());

        if let Some(previous) = previous.filter(|p| p.id != credential.id) {
            tracing::info!(
                tenant_id = %credential.tenant_id,
                previous_credential_id = %previous.id,
                credential_id = %credential.id,
                "Credential superseded"
            );
            self.history
                .entry(credential.tenant_id.clone())
                .or_default()
                .push(SupersededCredential {
                    credential_id: previous.id,
                    superseded_at: Utc::now(),
                });
            self.notification_states.remove(&previous.id);
        }
        Ok(())
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, RepositoryError> {
        Ok(self.credentials.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_notification_state(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<NotificationState>, RepositoryError> {
        Ok(self.notification_states.get(&credential_id).map(|s| s.clone()))
    }

    async fn save_notification_state(&self, state: &NotificationState) -> Result<(), RepositoryError> {
        self.notification_states
            .insert(state.credential_id, state.clone());
        Ok(())
    }
}
