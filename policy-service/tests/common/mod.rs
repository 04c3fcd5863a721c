#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use policy_service::config::PolicyServiceConfig;
use policy_service::models::{PolicyRule, PolicySpec, RuleAction};
use policy_service::services::notifier::MockNotifier;
use policy_service::services::provider::mock::{MockAccessProvider, MockToken};
use policy_service::services::repository::InMemoryTenantStore;
use policy_service::startup::{build_state, AppState, Application, Dependencies};
use secrecy::Secret;
use std::sync::Arc;

// Test constants for tenant context
pub const TEST_TENANT_ID: &str = "tenant-test";
pub const TEST_USER_ID: &str = "user_123";
pub const TEST_SECRET: &str = "secret-token-1";
pub const TEST_TOKEN_ID: &str = "tok-1";
pub const TEST_ACCOUNT_ID: &str = "acct-1";

/// Mock collaborators shared by the engine-level tests and the HTTP harness.
pub struct Mocks {
    pub provider: Arc<MockAccessProvider>,
    pub store: Arc<InMemoryTenantStore>,
    pub notifier: Arc<MockNotifier>,
}

impl Mocks {
    /// A provider with one account and one fully granted token expiring in
    /// `days` days from `now`.
    pub fn with_token_expiring(now: DateTime<Utc>, days: i64) -> Self {
        let provider = Arc::new(MockAccessProvider::new());
        provider.add_resource_group(TEST_ACCOUNT_ID, "Main Account");
        provider.add_token(
            TEST_SECRET,
            MockToken::fully_granted(TEST_TOKEN_ID).expiring_at(now + Duration::days(days)),
        );
        Self {
            provider,
            store: Arc::new(InMemoryTenantStore::new()),
            notifier: Arc::new(MockNotifier::new()),
        }
    }

    pub fn dependencies(&self) -> Dependencies {
        Dependencies {
            provider: self.provider.clone(),
            repository: self.store.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Wires the engine the same way the server does, without a listener.
    pub fn state(&self) -> AppState {
        build_state(&PolicyServiceConfig::for_tests(), self.dependencies())
    }
}

pub fn secret(value: &str) -> Secret<String> {
    Secret::new(value.to_string())
}

pub fn spec(domain: &str) -> PolicySpec {
    PolicySpec {
        name: format!("{} app", domain),
        domain: domain.to_string(),
        path: "/".to_string(),
        session_duration_minutes: 60,
        require_mfa: false,
        rules: vec![PolicyRule::new("email_domain", "@example.com", RuleAction::Allow)],
        zone_id: None,
    }
}

/// Accepts the test secret for `tenant` through the monitor.
pub async fn submit_test_credential(state: &AppState, tenant: &str, now: DateTime<Utc>) {
    let outcome = state
        .monitor
        .submit_credential(tenant, secret(TEST_SECRET), now)
        .await
        .expect("Submission failed");
    assert!(outcome.accepted, "Test credential was refused: {:?}", outcome);
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub mocks: Mocks,
    pub state: AppState,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(PolicyServiceConfig::for_tests()).await
    }

    pub async fn spawn_with(config: PolicyServiceConfig) -> Self {
        let mocks = Mocks::with_token_expiring(Utc::now(), 90);

        let app = Application::build_with(config, mocks.dependencies())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let state = app.state().clone();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to be ready by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            mocks,
            state,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("X-Tenant-ID", TEST_TENANT_ID)
            .header("X-User-ID", TEST_USER_ID)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header("X-Tenant-ID", TEST_TENANT_ID)
            .header("X-User-ID", TEST_USER_ID)
    }

    pub fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .put(self.url(path))
            .header("X-Tenant-ID", TEST_TENANT_ID)
            .header("X-User-ID", TEST_USER_ID)
    }

    /// Stores the test credential for the default tenant over HTTP.
    pub async fn configure_credential(&self) {
        let response = self
            .put("/api/v1/credentials")
            .json(&serde_json::json!({ "apiToken": TEST_SECRET }))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 200);
    }

    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }
}
