use crate::config::{PolicyServiceConfig, ProviderMode};
use crate::engine::capability_matrix::CapabilityMatrix;
use crate::engine::health_monitor::{CredentialHealthMonitor, HealthMonitorConfig};
use crate::engine::locks::KeyedLocks;
use crate::engine::reconciler::{PolicyReconciler, ReconcilerConfig};
use crate::engine::validator::CredentialValidator;
use crate::handlers;
use crate::services::notifier::{LoggingNotifier, Notifier, WebhookNotifier};
use crate::services::provider::{
    AccessProvider, CloudflareAccessProvider, MockAccessProvider, RetryingProvider,
};
use crate::services::provider::mock::MockToken;
use crate::services::repository::{InMemoryTenantStore, TenantRepository};
use axum::{
    middleware::from_fn,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use service_core::retry::RetryConfig;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Secret accepted by the mock provider in local development.
pub const DEV_MOCK_TOKEN: &str = "dev-token";

#[derive(Clone)]
pub struct AppState {
    pub config: PolicyServiceConfig,
    pub reconciler: Arc<PolicyReconciler>,
    pub monitor: Arc<CredentialHealthMonitor>,
    /// Cancelled when the server starts shutting down; in-flight
    /// reconciliations observe it between items.
    pub shutdown: CancellationToken,
}

/// External collaborators. Tests substitute mocks through
/// [`Application::build_with`].
pub struct Dependencies {
    pub provider: Arc<dyn AccessProvider>,
    pub repository: Arc<dyn TenantRepository>,
    pub notifier: Arc<dyn Notifier>,
}

impl Dependencies {
    pub fn from_config(config: &PolicyServiceConfig) -> Result<Self, AppError> {
        let provider: Arc<dyn AccessProvider> = match config.provider.mode {
            ProviderMode::Http => {
                tracing::info!(base_url = %config.provider.api_base_url, "Using HTTP access provider");
                Arc::new(
                    CloudflareAccessProvider::new(
                        config.provider.api_base_url.clone(),
                        Duration::from_secs(config.provider.request_timeout_secs),
                    )
                    .map_err(|e| {
                        tracing::error!("Failed to build provider client: {}", e);
                        AppError::ConfigError(anyhow::anyhow!(e.to_string()))
                    })?,
                )
            }
            ProviderMode::Mock => {
                tracing::warn!("Using mock access provider");
                let mock = MockAccessProvider::new();
                mock.add_resource_group("mock-account", "Mock Account");
                mock.add_token(
                    DEV_MOCK_TOKEN,
                    MockToken::fully_granted("mock-token")
                        .expiring_at(Utc::now() + chrono::Duration::days(90)),
                );
                Arc::new(mock)
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
            Some(url) => {
                tracing::info!("Webhook notifier initialized");
                Arc::new(
                    WebhookNotifier::new(
                        url.clone(),
                        Duration::from_secs(config.provider.request_timeout_secs),
                    )
                    .map_err(|e| {
                        tracing::error!("Failed to build webhook notifier: {}", e);
                        AppError::ConfigError(anyhow::anyhow!(e.to_string()))
                    })?,
                )
            }
            None => {
                tracing::info!("No webhook configured, notifications are logged only");
                Arc::new(LoggingNotifier)
            }
        };

        Ok(Self {
            provider,
            repository: Arc::new(InMemoryTenantStore::new()),
            notifier,
        })
    }
}

pub fn build_state(config: &PolicyServiceConfig, deps: Dependencies) -> AppState {
    let retry = RetryConfig {
        max_retries: config.provider.max_retries,
        initial_backoff: Duration::from_millis(config.provider.retry_backoff_ms),
        attempt_timeout: Duration::from_secs(config.provider.request_timeout_secs),
        ..Default::default()
    };
    let provider: Arc<dyn AccessProvider> =
        Arc::new(RetryingProvider::new(deps.provider, retry));

    let validator = Arc::new(CredentialValidator::new(
        provider.clone(),
        Arc::new(CapabilityMatrix::current()),
    ));

    let monitor = CredentialHealthMonitor::new(
        validator,
        deps.repository.clone(),
        deps.notifier,
        HealthMonitorConfig {
            expiring_window: chrono::Duration::days(config.credentials.expiring_window_days),
            degraded_after_failures: config.credentials.degraded_after_failures,
            ..Default::default()
        },
    );

    let reconciler = PolicyReconciler::new(
        provider,
        deps.repository,
        Arc::new(KeyedLocks::new()),
        ReconcilerConfig {
            max_concurrency: config.reconciler.max_concurrency,
        },
    );

    AppState {
        config: config.clone(),
        reconciler: Arc::new(reconciler),
        monitor: Arc::new(monitor),
        shutdown: CancellationToken::new(),
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/api/v1/policies/check", post(handlers::check_policy))
        .route("/api/v1/policies/upsert", post(handlers::upsert_policy))
        .route("/api/v1/policies/bulk", post(handlers::bulk_reconcile))
        .route("/api/v1/credentials", put(handlers::submit_credential))
        .route("/api/v1/credentials/status", get(handlers::credential_status))
        .route(
            "/api/v1/credentials/validate",
            post(handlers::revalidate_credential),
        )
        .route(
            "/internal/jobs/credential-health",
            post(handlers::run_credential_health),
        )
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    pub async fn build(config: PolicyServiceConfig) -> Result<Self, AppError> {
        let deps = Dependencies::from_config(&config)?;
        Self::build_with(config, deps).await
    }

    pub async fn build_with(
        config: PolicyServiceConfig,
        deps: Dependencies,
    ) -> Result<Self, AppError> {
        let state = build_state(&config, deps);
        let app = build_router(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app)
            .with_graceful_shutdown(state.shutdown.clone().cancelled_owned());

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Cancelling this token drains the server and stops new reconciliation
    /// work.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifier::MockNotifier;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let deps = Dependencies {
            provider: Arc::new(MockAccessProvider::new()),
            repository: Arc::new(InMemoryTenantStore::new()),
            notifier: Arc::new(MockNotifier::new()),
        };
        build_router(build_state(&PolicyServiceConfig::for_tests(), deps))
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let response = test_router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["service"], "policy-service");
    }

    #[tokio::test]
    async fn readiness_flips_when_shutdown_starts() {
        let deps = Dependencies {
            provider: Arc::new(MockAccessProvider::new()),
            repository: Arc::new(InMemoryTenantStore::new()),
            notifier: Arc::new(MockNotifier::new()),
        };
        let state = build_state(&PolicyServiceConfig::for_tests(), deps);
        let shutdown = state.shutdown.clone();
        let router = build_router(state);

        let ready = router
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);

        shutdown.cancel();
        let draining = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(draining.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn status_requires_tenant_header() {
        let response = test_router()
            .oneshot(
                Request::get("/api/v1/credentials/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn mock_mode_seeds_a_usable_dev_token() {
        let deps = Dependencies::from_config(&PolicyServiceConfig::for_tests()).unwrap();
        assert_eq!(deps.provider.name(), "mock");
    }
}
