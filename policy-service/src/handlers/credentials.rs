use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use crate::engine::health_monitor::TenantCheck;
use crate::middleware::TenantContext;
use crate::models::CredentialStatusView;
use crate::startup::AppState;

/// Deliberately not `Debug`: carries the raw secret.
#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCredentialRequest {
    #[validate(length(min = 1, max = 4096, message = "apiToken must not be empty"))]
    pub api_token: String,
}

#[derive(Debug, Serialize)]
pub struct RevalidationResponse {
    pub check: TenantCheck,
    pub status: CredentialStatusView,
}

/// Replace the tenant's credential. Refused credentials are not stored.
pub async fn submit_credential(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(request): Json<SubmitCredentialRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;

    let outcome = state
        .monitor
        .submit_credential(
            &tenant.tenant_id,
            Secret::new(request.api_token.trim().to_string()),
            Utc::now(),
        )
        .await?;

    let status = if outcome.accepted {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(outcome)))
}

pub async fn credential_status(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<impl IntoResponse, AppError> {
    let view = state
        .monitor
        .credential_status(&tenant.tenant_id, Utc::now())
        .await?;
    Ok(Json(view))
}

/// On-demand re-validation of the stored credential.
pub async fn revalidate_credential(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let check = state.monitor.check_tenant(&tenant.tenant_id, now).await?;
    let status = state
        .monitor
        .credential_status(&tenant.tenant_id, now)
        .await?;
    Ok(Json(RevalidationResponse { check, status }))
}
