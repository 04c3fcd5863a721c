//! Tenant context extracted from request headers.
//!
//! The BFF authenticates the caller and forwards the tenant it resolved in
//! `X-Tenant-ID`, plus the acting user in `X-User-ID` when there is one.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const TENANT_HEADER: &str = "X-Tenant-ID";
pub const USER_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing X-Tenant-ID header (required from BFF)"
                ))
            })?;

        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let span = tracing::Span::current();
        span.record("tenant_id", tenant_id);

        Ok(TenantContext {
            tenant_id: tenant_id.to_string(),
            user_id,
        })
    }
}
