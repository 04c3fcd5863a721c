use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use chrono::Utc;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use subtle::ConstantTimeEq;

use crate::startup::AppState;

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = &state.config.jobs.token else {
        if state.config.common.is_prod() {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Job endpoint is disabled without a job token"
            )));
        }
        return Ok(());
    };

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    if bool::from(presented.as_bytes().ct_eq(expected.expose_secret().as_bytes())) {
        Ok(())
    } else {
        Err(AppError::Unauthorized(anyhow::anyhow!("Invalid job token")))
    }
}

/// Scheduler entry point: one credential health tick over every tenant.
pub async fn run_credential_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &headers)?;
    let summary = state.monitor.run_scheduled_checks(Utc::now()).await?;
    Ok(Json(summary))
}
