use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use validator::Validate;

use crate::engine::identity::IdentityKey;
use crate::engine::reconciler::ReconcileOptions;
use crate::middleware::TenantContext;
use crate::models::{
    PolicySpec, ReconcileError, ReconcileErrorKind, ReconcileSummary, ReconciliationResult,
};
use crate::services::metrics;
use crate::startup::AppState;

/// Items stay raw JSON so one malformed policy fails alone.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BulkReconcileRequest {
    #[validate(length(min = 1, max = 500, message = "between 1 and 500 policies per request"))]
    pub policies: Vec<Value>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct BulkReconcileResponse {
    pub summary: ReconcileSummary,
    pub results: Vec<ReconciliationResult>,
}

/// Identity for an item that did not parse, from whatever domain and path it carries.
fn raw_identity(raw: &Value, index: usize) -> String {
    match raw.get("domain").and_then(Value::as_str) {
        Some(domain) => {
            let path = raw.get("path").and_then(Value::as_str).unwrap_or("/");
            IdentityKey::resolve(domain, path).to_string()
        }
        None => format!("#{}", index),
    }
}

/// HTTP status for a single-item result.
fn status_for(result: &ReconciliationResult) -> StatusCode {
    let Some(error) = &result.error else {
        return StatusCode::OK;
    };
    match error.kind {
        ReconcileErrorKind::ValidationRejected => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileErrorKind::ConflictDuringMutation => StatusCode::CONFLICT,
        ReconcileErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ReconcileErrorKind::ProviderUnreachable | ReconcileErrorKind::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ReconcileErrorKind::AuthRejected
        | ReconcileErrorKind::PermissionDenied
        | ReconcileErrorKind::CredentialUnavailable => StatusCode::PRECONDITION_FAILED,
        ReconcileErrorKind::ProviderError => StatusCode::BAD_GATEWAY,
    }
}

async fn reconcile_one(
    state: &AppState,
    tenant: &TenantContext,
    spec: PolicySpec,
    options: ReconcileOptions,
) -> Result<(StatusCode, Json<ReconciliationResult>), AppError> {
    let result = state
        .reconciler
        .reconcile(&tenant.tenant_id, vec![spec], options)
        .await
        .into_iter()
        .next()
        .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("reconciler returned no result")))?;

    Ok((status_for(&result), Json(result)))
}

/// Preview: diff a single spec against the provider without mutating.
pub async fn check_policy(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(spec): Json<PolicySpec>,
) -> Result<impl IntoResponse, AppError> {
    reconcile_one(&state, &tenant, spec, ReconcileOptions::dry_run()).await
}

pub async fn upsert_policy(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(spec): Json<PolicySpec>,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!(
        tenant_id = %tenant.tenant_id,
        user_id = ?tenant.user_id,
        domain = %spec.domain,
        "Policy upsert requested"
    );
    let options = ReconcileOptions {
        dry_run: false,
        cancel: state.shutdown.child_token(),
    };
    reconcile_one(&state, &tenant, spec, options).await
}

/// Batch reconcile. Per-item failures are reported in the results, not as an HTTP error.
pub async fn bulk_reconcile(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(request): Json<BulkReconcileRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;

    let dry_run = request.dry_run;

    // `None` marks a slot filled by the reconciler, in order.
    let mut slots: Vec<Option<ReconciliationResult>> = Vec::with_capacity(request.policies.len());
    let mut specs = Vec::new();
    for (index, raw) in request.policies.into_iter().enumerate() {
        let identity = raw_identity(&raw, index);
        match serde_json::from_value::<PolicySpec>(raw) {
            Ok(spec) => {
                specs.push(spec);
                slots.push(None);
            }
            Err(e) => {
                tracing::warn!(index, identity_key = %identity, error = %e, "Malformed policy in bulk request");
                metrics::record_reconcile_action("error");
                slots.push(Some(ReconciliationResult::failed(
                    identity,
                    ReconcileError::new(
                        ReconcileErrorKind::ValidationRejected,
                        format!("policies[{}]: {}", index, e),
                    ),
                    dry_run,
                )));
            }
        }
    }

    let mut reconciled = if specs.is_empty() {
        Vec::new().into_iter()
    } else {
        let options = ReconcileOptions {
            dry_run,
            cancel: state.shutdown.child_token(),
        };
        state
            .reconciler
            .reconcile(&tenant.tenant_id, specs, options)
            .await
            .into_iter()
    };

    let mut results = Vec::with_capacity(slots.len());
    for slot in slots {
        let result = match slot {
            Some(failed) => failed,
            None => reconciled.next().ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!("reconciler returned fewer results than policies"))
            })?,
        };
        results.push(result);
    }

    Ok(Json(BulkReconcileResponse {
        summary: ReconcileSummary::from_results(&results),
        results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReconcileAction, ReconcileError};

    #[test]
    fn success_is_ok() {
        let r = ReconciliationResult {
            identity_key: "a|/".into(),
            action: ReconcileAction::Create,
            diff: vec![],
            provider_id: Some("p".into()),
            error: None,
            dry_run: false,
        };
        assert_eq!(status_for(&r), StatusCode::OK);
    }

    #[test]
    fn malformed_item_identity_uses_what_it_carries() {
        let raw = serde_json::json!({ "domain": "Wiki.Example.com", "path": "/docs/" });
        assert_eq!(raw_identity(&raw, 3), "wiki.example.com|/docs");
        assert_eq!(raw_identity(&serde_json::json!({ "name": "x" }), 3), "#3");
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let failed = |kind| {
            ReconciliationResult::failed("a|/", ReconcileError::new(kind, "x"), false)
        };
        assert_eq!(
            status_for(&failed(ReconcileErrorKind::ValidationRejected)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&failed(ReconcileErrorKind::CredentialUnavailable)),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            status_for(&failed(ReconcileErrorKind::ProviderUnreachable)),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
