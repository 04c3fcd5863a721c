use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{self as core_config, env_opt, env_or};
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

use crate::services::provider::cloudflare::DEFAULT_API_BASE_URL;

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyServiceConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub provider: ProviderConfig,
    pub reconciler: ReconcilerSettings,
    pub credentials: CredentialSettings,
    pub notifications: NotificationSettings,
    pub jobs: JobSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Http,
    Mock,
}

impl FromStr for ProviderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown provider mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub mode: ProviderMode,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerSettings {
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSettings {
    pub expiring_window_days: i64,
    pub degraded_after_failures: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    /// Unset logs notifications instead of posting them.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSettings {
    /// Bearer token required by the scheduler endpoint. Mandatory in prod;
    /// elsewhere unset leaves the endpoint open.
    pub token: Option<Secret<String>>,
}

impl PolicyServiceConfig {
    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let mode = env_or("PROVIDER_MODE", ProviderMode::Http)?;

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "policy-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env_opt("OTLP_ENDPOINT"),
            provider: ProviderConfig {
                mode,
                api_base_url: env::var("PROVIDER_API_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
                request_timeout_secs: env_or("PROVIDER_REQUEST_TIMEOUT_SECS", 10)?,
                max_retries: env_or("PROVIDER_MAX_RETRIES", 2)?,
                retry_backoff_ms: env_or("PROVIDER_RETRY_BACKOFF_MS", 200)?,
            },
            reconciler: ReconcilerSettings {
                max_concurrency: env_or("RECONCILER_MAX_CONCURRENCY", 4)?,
            },
            credentials: CredentialSettings {
                expiring_window_days: env_or("CREDENTIAL_EXPIRING_WINDOW_DAYS", 7)?,
                degraded_after_failures: env_or("CREDENTIAL_DEGRADED_AFTER_FAILURES", 3)?,
            },
            notifications: NotificationSettings {
                webhook_url: env_opt("NOTIFICATION_WEBHOOK_URL"),
            },
            jobs: JobSettings {
                token: env_opt("JOB_TOKEN").map(Secret::new),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.is_prod() {
            if self.provider.mode == ProviderMode::Mock {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "PROVIDER_MODE=mock is not allowed in production"
                )));
            }
            if self.jobs.token.is_none() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "JOB_TOKEN is required in production"
                )));
            }
        }
        if self.reconciler.max_concurrency == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RECONCILER_MAX_CONCURRENCY must be at least 1"
            )));
        }
        if self.credentials.expiring_window_days < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CREDENTIAL_EXPIRING_WINDOW_DAYS must not be negative"
            )));
        }
        if self.credentials.degraded_after_failures == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CREDENTIAL_DEGRADED_AFTER_FAILURES must be at least 1"
            )));
        }
        Ok(())
    }

    /// Local-development defaults: mock provider, random port.
    pub fn for_tests() -> Self {
        Self {
            common: core_config::Config {
                port: 0,
                environment: "test".to_string(),
            },
            service_name: "policy-service".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            provider: ProviderConfig {
                mode: ProviderMode::Mock,
                api_base_url: DEFAULT_API_BASE_URL.to_string(),
                request_timeout_secs: 2,
                max_retries: 2,
                retry_backoff_ms: 5,
            },
            reconciler: ReconcilerSettings { max_concurrency: 4 },
            credentials: CredentialSettings {
                expiring_window_days: 7,
                degraded_after_failures: 3,
            },
            notifications: NotificationSettings { webhook_url: None },
            jobs: JobSettings { token: None },
        }
    }
}
