use super::{AccessProvider, ProviderError, TokenState, TokenVerification};
use crate::models::{PolicyRule, PolicySpec, RemotePolicy, ResourceGroup, RuleAction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

const MFA_REQUIREMENT: &str = "auth_method";

const PAGE_SIZE: u32 = 50;
const MAX_PAGES: u32 = 200;

/// Cloudflare Zero Trust Access adapter.
pub struct CloudflareAccessProvider {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResult {
    id: String,
    status: TokenState,
    #[serde(default)]
    expires_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenDetails {
    #[serde(default)]
    policies: Vec<TokenPolicy>,
}

#[derive(Debug, Deserialize)]
struct TokenPolicy {
    effect: String,
    #[serde(default)]
    permission_groups: Vec<PermissionGroup>,
}

#[derive(Debug, Deserialize)]
struct PermissionGroup {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AccountWire {
    id: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessAppWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    domain: String,
    #[serde(rename = "type", default = "self_hosted")]
    app_type: String,
    #[serde(default = "default_session")]
    session_duration: String,
    #[serde(default)]
    policies: Vec<AccessPolicyWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    zone_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessPolicyWire {
    name: String,
    decision: String,
    #[serde(default)]
    include: Vec<serde_json::Value>,
    #[serde(default)]
    require: Vec<serde_json::Value>,
}

fn self_hosted() -> String {
    "self_hosted".to_string()
}

fn default_session() -> String {
    "24h".to_string()
}

impl CloudflareAccessProvider {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Unexpected(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &str,
    ) -> Result<T, ProviderError> {
        self.send_with_info(request, operation)
            .await
            .map(|(result, _)| result)
    }

    /// Reads every page of a list endpoint.
    async fn send_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        credential: &Secret<String>,
        operation: &str,
    ) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let request = self
                .client
                .get(self.url(path))
                .query(&[("page", page), ("per_page", PAGE_SIZE)])
                .bearer_auth(credential.expose_secret());
            let (batch, info): (Vec<T>, _) = self.send_with_info(request, operation).await?;
            let fetched = batch.len();
            items.extend(batch);

            let more = match info {
                Some(info) => info.page.max(page) < info.total_pages,
                None => false,
            };
            if !more || fetched == 0 {
                break;
            }
            if page >= MAX_PAGES {
                tracing::warn!(operation, pages = page, "Stopped paging at the page limit");
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    async fn send_with_info<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &str,
    ) -> Result<(T, Option<ResultInfo>), ProviderError> {
        let response = request.send().await.map_err(|e| {
            ProviderError::Unreachable(format!("{} request failed: {}", operation, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            ProviderError::Unexpected(format!("Failed to parse {} response: {}", operation, e))
        })?;

        if !envelope.success {
            return Err(ProviderError::Unexpected(join_messages(&envelope.errors)));
        }

        let info = envelope.result_info;
        envelope
            .result
            .map(|result| (result, info))
            .ok_or_else(|| ProviderError::Unexpected(format!("{} response had no result", operation)))
    }
}

#[async_trait]
impl AccessProvider for CloudflareAccessProvider {
    async fn verify_credential(
        &self,
        credential: &Secret<String>,
    ) -> Result<TokenVerification, ProviderError> {
        let request = self
            .client
            .get(self.url("/user/tokens/verify"))
            .bearer_auth(credential.expose_secret());
        let result: VerifyResult = self.send(request, "verify_credential").await?;

        Ok(TokenVerification {
            token_id: result.id,
            state: result.status,
            expires_at: result.expires_on,
        })
    }

    async fn check_permission(
        &self,
        credential: &Secret<String>,
        token_id: &str,
        grant: &str,
    ) -> Result<bool, ProviderError> {
        let request = self
            .client
            .get(self.url(&format!("/user/tokens/{}", token_id)))
            .bearer_auth(credential.expose_secret());
        let details: TokenDetails = self.send(request, "check_permission").await?;

        Ok(details
            .policies
            .iter()
            .filter(|p| p.effect.eq_ignore_ascii_case("allow"))
            .flat_map(|p| p.permission_groups.iter())
            .any(|g| g.name.eq_ignore_ascii_case(grant)))
    }

    async fn list_resource_groups(
        &self,
        credential: &Secret<String>,
    ) -> Result<Vec<ResourceGroup>, ProviderError> {
        let accounts: Vec<AccountWire> = self
            .send_paged("/accounts", credential, "list_resource_groups")
            .await?;

        Ok(accounts
            .into_iter()
            .map(|a| ResourceGroup {
                id: a.id,
                name: a.name,
            })
            .collect())
    }

    async fn list_policies(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
    ) -> Result<Vec<RemotePolicy>, ProviderError> {
        let apps: Vec<AccessAppWire> = self
            .send_paged(
                &format!("/accounts/{}/access/apps", resource_group.id),
                credential,
                "list_policies",
            )
            .await?;

        Ok(apps
            .into_iter()
            .filter(|app| app.app_type == "self_hosted")
            .filter_map(|app| app_to_remote(app, &resource_group.id))
            .collect())
    }

    async fn create_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError> {
        let request = self
            .client
            .post(self.url(&format!("/accounts/{}/access/apps", resource_group.id)))
            .bearer_auth(credential.expose_secret())
            .json(&spec_to_app(spec, None));
        let app: AccessAppWire = self.send(request, "create_policy").await?;

        app_to_remote(app, &resource_group.id)
            .ok_or_else(|| ProviderError::Unexpected("created app has no id".to_string()))
    }

    async fn update_policy(
        &self,
        credential: &Secret<String>,
        resource_group: &ResourceGroup,
        provider_id: &str,
        spec: &PolicySpec,
    ) -> Result<RemotePolicy, ProviderError> {
        let request = self
            .client
            .put(self.url(&format!(
                "/accounts/{}/access/apps/{}",
                resource_group.id, provider_id
            )))
            .bearer_auth(credential.expose_secret())
            .json(&spec_to_app(spec, Some(provider_id.to_string())));
        let app: AccessAppWire = self.send(request, "update_policy").await?;

        app_to_remote(app, &resource_group.id)
            .ok_or_else(|| ProviderError::Unexpected("updated app has no id".to_string()))
    }

    fn name(&self) -> &'static str {
        "cloudflare"
    }
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<Envelope<serde_json::Value>>(body)
        .ok()
        .map(|e| join_messages(&e.errors))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::UNAUTHORIZED => ProviderError::AuthRejected(detail),
        StatusCode::FORBIDDEN => ProviderError::PermissionDenied(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::ValidationRejected(detail)
        }
        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            ProviderError::Conflict(detail)
        }
        s if s.is_server_error() => ProviderError::Unreachable(detail),
        _ => ProviderError::Unexpected(detail),
    }
}

fn join_messages(messages: &[ApiMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{} ({})", m.message, m.code))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Name of the inner field carrying a rule's value.
fn rule_value_field(rule_type: &str) -> &'static str {
    match rule_type {
        "email" => "email",
        "email_domain" => "domain",
        "ip" => "ip",
        "group" => "id",
        "geo" => "country_code",
        _ => "value",
    }
}

fn rule_to_wire(rule: &PolicyRule) -> serde_json::Value {
    let mut inner = serde_json::Map::new();
    inner.insert(
        rule_value_field(&rule.rule_type).to_string(),
        json!(rule.value),
    );
    let mut outer = serde_json::Map::new();
    outer.insert(rule.rule_type.clone(), serde_json::Value::Object(inner));
    serde_json::Value::Object(outer)
}

fn rule_from_wire(value: &serde_json::Value, action: RuleAction) -> Option<PolicyRule> {
    let (rule_type, inner) = value.as_object()?.iter().next()?;
    let rule_value = match inner {
        serde_json::Value::Object(fields) => fields
            .get(rule_value_field(rule_type))
            .or_else(|| fields.values().next())
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => String::new(),
    };
    Some(PolicyRule::new(rule_type.clone(), rule_value, action))
}

fn mfa_requirement() -> serde_json::Value {
    json!({ MFA_REQUIREMENT: { MFA_REQUIREMENT: "mfa" } })
}

fn spec_to_app(spec: &PolicySpec, id: Option<String>) -> AccessAppWire {
    let require = if spec.require_mfa {
        vec![mfa_requirement()]
    } else {
        Vec::new()
    };

    let mut policies = Vec::new();
    for (action, label) in [(RuleAction::Allow, "Allow"), (RuleAction::Deny, "Deny")] {
        let include: Vec<_> = spec
            .rules
            .iter()
            .filter(|r| r.action == action)
            .map(rule_to_wire)
            .collect();
        if !include.is_empty() {
            policies.push(AccessPolicyWire {
                name: format!("{} - {}", spec.name, label),
                decision: action.as_str().to_string(),
                include,
                require: require.clone(),
            });
        }
    }

    let path = crate::engine::identity::normalize_path(&spec.path);
    let domain = spec.domain.trim().trim_end_matches('/');
    AccessAppWire {
        id,
        name: spec.name.clone(),
        domain: if path == "/" {
            domain.to_string()
        } else {
            format!("{}{}", domain, path)
        },
        app_type: self_hosted(),
        session_duration: format!("{}m", spec.session_duration_minutes),
        policies,
        zone_id: spec.zone_id.clone(),
    }
}

fn app_to_remote(app: AccessAppWire, resource_group_id: &str) -> Option<RemotePolicy> {
    let provider_id = app.id?;
    let (domain, path) = match app.domain.find('/') {
        Some(idx) => (app.domain[..idx].to_string(), app.domain[idx..].to_string()),
        None => (app.domain.clone(), "/".to_string()),
    };

    let mut rules = Vec::new();
    let mut require_mfa = false;
    for policy in &app.policies {
        let action = if policy.decision.eq_ignore_ascii_case("deny") {
            RuleAction::Deny
        } else {
            RuleAction::Allow
        };
        rules.extend(policy.include.iter().filter_map(|r| rule_from_wire(r, action)));
        require_mfa |= policy.require.iter().any(|r| r.get(MFA_REQUIREMENT).is_some());
    }

    Some(RemotePolicy {
        provider_id,
        resource_group_id: resource_group_id.to_string(),
        name: app.name,
        domain,
        path,
        session_duration_minutes: parse_duration_minutes(&app.session_duration).unwrap_or(1440),
        require_mfa,
        rules,
        zone_id: app.zone_id,
    })
}

/// Parses provider durations such as `24h`, `90m` or `1h30m` into minutes.
fn parse_duration_minutes(raw: &str) -> Option<u32> {
    let mut total_secs: u64 = 0;
    let mut digits = String::new();
    for ch in raw.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: u64 = digits.parse().ok()?;
        digits.clear();
        total_secs += match ch {
            'h' => n * 3600,
            'm' => n * 60,
            's' => n,
            _ => return None,
        };
    }
    if !digits.is_empty() {
        return None;
    }
    u32::try_from(total_secs / 60).ok().filter(|m| *m > 0)
}
