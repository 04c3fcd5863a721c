mod common;

use common::{TestApp, TEST_ACCOUNT_ID, TEST_TENANT_ID};
use policy_service::config::PolicyServiceConfig;
use policy_service::services::init_metrics;
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::Once;

static INIT_METRICS: Once = Once::new();

fn ensure_metrics_initialized() {
    INIT_METRICS.call_once(|| {
        init_metrics().ok();
    });
}

fn policy(domain: &str) -> Value {
    json!({
        "name": format!("{} app", domain),
        "domain": domain,
        "sessionDurationMinutes": 120,
        "requireMfa": true,
        "rules": [
            { "type": "email_domain", "value": "@example.com", "action": "allow" }
        ]
    })
}

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "policy-service");
}

#[tokio::test]
async fn readiness_fails_after_shutdown_begins() {
    let app = TestApp::spawn().await;

    let response = app.client.get(app.url("/ready")).send().await.unwrap();
    assert!(response.status().is_success());

    // Checked in-process: the listener drains once the token is cancelled
    app.shutdown();
    assert!(app.state.shutdown.is_cancelled());
}

#[tokio::test]
async fn metrics_endpoint_returns_prometheus_format() {
    ensure_metrics_initialized();
    let app = TestApp::spawn().await;

    let response = app.client.get(app.url("/metrics")).send().await.unwrap();
    assert!(response.status().is_success());

    let content_type = response
        .headers()
        .get("content-type")
        .expect("Missing content-type header")
        .to_str()
        .expect("Invalid content-type")
        .to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn requests_without_tenant_are_unauthorized() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(app.url("/api/v1/policies/upsert"))
        .json(&policy("a.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn credential_submission_and_status() {
    let app = TestApp::spawn().await;

    let response = app.get("/api/v1/credentials/status").send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "unconfigured");

    let response = app
        .put("/api/v1/credentials")
        .json(&json!({ "apiToken": "not-a-real-token" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], false);

    app.configure_credential().await;

    let response = app.get("/api/v1/credentials/status").send().await.unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "valid");
    assert_eq!(body["tenantId"], TEST_TENANT_ID);
    assert_eq!(body["resourceGroups"][0]["id"], TEST_ACCOUNT_ID);
    // The secret never appears in responses
    assert!(!body.to_string().contains(common::TEST_SECRET));
}

#[tokio::test]
async fn upsert_creates_then_skips() {
    let app = TestApp::spawn().await;
    app.configure_credential().await;

    let response = app
        .post("/api/v1/policies/upsert")
        .json(&policy("wiki.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let first: Value = response.json().await.unwrap();
    assert_eq!(first["action"], "create");
    assert_eq!(first["identityKey"], "wiki.example.com|/");
    assert_eq!(first["dryRun"], false);

    let response = app
        .post("/api/v1/policies/upsert")
        .json(&policy("wiki.example.com"))
        .send()
        .await
        .unwrap();
    let second: Value = response.json().await.unwrap();
    assert_eq!(second["action"], "skip");
    assert_eq!(second["providerId"], first["providerId"]);
    assert_eq!(app.mocks.provider.create_count(), 1);
}

#[tokio::test]
async fn check_previews_without_mutating() {
    let app = TestApp::spawn().await;
    app.configure_credential().await;

    let response = app
        .post("/api/v1/policies/check")
        .json(&policy("preview.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["action"], "create");
    assert_eq!(body["dryRun"], true);
    assert!(body["diff"].as_array().is_some_and(|d| d.is_empty()));
    assert_eq!(app.mocks.provider.create_count(), 0);

    // Against an existing policy the preview lists the drifted fields
    app.post("/api/v1/policies/upsert")
        .json(&policy("preview.example.com"))
        .send()
        .await
        .unwrap();
    let mut drifted = policy("preview.example.com");
    drifted["sessionDurationMinutes"] = json!(30);
    let response = app
        .post("/api/v1/policies/check")
        .json(&drifted)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["action"], "update");
    assert_eq!(body["diff"][0]["field"], "sessionDurationMinutes");
    assert_eq!(body["diff"][0]["old"], 120);
    assert_eq!(body["diff"][0]["new"], 30);
    assert_eq!(app.mocks.provider.update_count(), 0);
}

#[tokio::test]
async fn upsert_without_credential_is_a_precondition_failure() {
    let app = TestApp::spawn().await;

    let response = app
        .post("/api/v1/policies/upsert")
        .json(&policy("a.example.com"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 412);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "credential_unavailable");
}

#[tokio::test]
async fn invalid_policy_is_unprocessable() {
    let app = TestApp::spawn().await;
    app.configure_credential().await;

    let mut bad = policy("bad.example.com");
    bad["rules"] = json!([]);
    let response = app
        .post("/api/v1/policies/upsert")
        .json(&bad)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn bulk_reports_per_item_results_and_summary() {
    let app = TestApp::spawn().await;
    app.configure_credential().await;

    let mut bad = policy("bad.example.com");
    bad["sessionDurationMinutes"] = json!(0);

    let response = app
        .post("/api/v1/policies/bulk")
        .json(&json!({
            "policies": [policy("one.example.com"), bad, policy("two.example.com")]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["summary"]["total"], 3);
    assert_eq!(body["summary"]["created"], 2);
    assert_eq!(body["summary"]["failed"], 1);
    assert_eq!(body["results"][0]["identityKey"], "one.example.com|/");
    assert_eq!(body["results"][1]["error"]["kind"], "validation_rejected");
    assert_eq!(body["results"][2]["identityKey"], "two.example.com|/");
}

#[tokio::test]
async fn malformed_bulk_item_fails_alone() {
    let app = TestApp::spawn().await;
    app.configure_credential().await;

    let mut malformed = policy("mid.example.com");
    malformed["rules"][0]["action"] = json!("maybe");
    let missing_domain = json!({ "name": "nameless", "rules": [] });

    let response = app
        .post("/api/v1/policies/bulk")
        .json(&json!({
            "policies": [
                policy("one.example.com"),
                malformed,
                missing_domain,
                policy("two.example.com")
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["summary"]["total"], 4);
    assert_eq!(body["summary"]["created"], 2);
    assert_eq!(body["summary"]["failed"], 2);
    assert_eq!(body["results"][0]["identityKey"], "one.example.com|/");
    assert_eq!(body["results"][1]["identityKey"], "mid.example.com|/");
    assert_eq!(body["results"][1]["error"]["kind"], "validation_rejected");
    assert_eq!(body["results"][2]["identityKey"], "#2");
    assert_eq!(body["results"][2]["error"]["kind"], "validation_rejected");
    assert_eq!(body["results"][3]["identityKey"], "two.example.com|/");
    assert_eq!(app.mocks.provider.create_count(), 2);
}

#[tokio::test]
async fn empty_bulk_request_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .post("/api/v1/policies/bulk")
        .json(&json!({ "policies": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn revalidate_reports_check_and_status() {
    let app = TestApp::spawn().await;
    app.configure_credential().await;

    let response = app
        .post("/api/v1/credentials/validate")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["check"]["outcome"], "evaluated");
    assert_eq!(body["status"]["status"], "valid");
}

#[tokio::test]
async fn job_endpoint_requires_the_configured_token() {
    let mut config = PolicyServiceConfig::for_tests();
    config.jobs.token = Some(Secret::new("job-secret".to_string()));
    let app = TestApp::spawn_with(config).await;
    app.configure_credential().await;

    let response = app
        .client
        .post(app.url("/internal/jobs/credential-health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = app
        .client
        .post(app.url("/internal/jobs/credential-health"))
        .bearer_auth("job-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["checked"], 1);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::spawn().await;

    let response = app.client.get(app.url("/health")).send().await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
