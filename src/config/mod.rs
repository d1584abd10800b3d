// Configuration module for the relay gateway

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::provider::{validate_configuration, Provider};
use crate::proxy::pricing::PriceEntry;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Keys accepted from callers. Empty disables inbound key checks.
    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub primary_gateway: PrimaryGatewayConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub pricing: Vec<PriceEntry>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18100
}

fn default_body_limit() -> usize {
    32 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    /// Rotate the first attempt across candidates instead of always starting
    /// at the highest priority.
    #[serde(default)]
    pub round_robin: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Per-attempt timeout, covering the whole upstream response.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            round_robin: false,
            retry_count: default_retry_count(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

fn default_retry_count() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    120
}

fn default_pool_max_idle() -> usize {
    20
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_line_bytes() -> usize {
    crate::proxy::relay::DEFAULT_MAX_LINE_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderConfig {
    /// Provider service base URL. When empty, `providers` is used instead.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub providers: Vec<Provider>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: default_provider_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            providers: Vec::new(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_provider_timeout() -> u64 {
    5
}

fn default_cache_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BillingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_billing_timeout")]
    pub timeout_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            timeout_secs: default_billing_timeout(),
        }
    }
}

impl BillingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_billing_timeout() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrimaryGatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    /// When false, a failed primary gateway fails the request instead of
    /// falling back to local providers.
    #[serde(default = "default_true")]
    pub fallback_to_providers: bool,
}

impl Default for PrimaryGatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            fallback_to_providers: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    #[serde(default = "default_log_subject")]
    pub subject: String,
    /// Also publish a usage event here when set.
    #[serde(default)]
    pub billing_subject: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nats_url: default_nats_url(),
            subject: default_log_subject(),
            billing_subject: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_log_subject() -> String {
    "log.write".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("Invalid env var regex")
});

/// Replace `${VAR}` and `${VAR:-default}` with values from the environment.
/// Unset variables without a default become empty.
pub fn expand_env(raw: &str) -> String {
    ENV_VAR
        .replace_all(raw, |caps: &Captures| match std::env::var(&caps[1]) {
            Ok(value) if !value.is_empty() => value,
            _ => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
        .into_owned()
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content)?;
        tracing::info!("Config loaded from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(&expand_env(content))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.retry_count == 0 {
            return Err(ConfigError::Invalid("proxy.retry-count must be at least 1".to_string()));
        }
        if self.telemetry.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.queue-capacity must be at least 1".to_string(),
            ));
        }
        if self.billing.enabled && self.billing.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "billing.endpoint is required when billing is enabled".to_string(),
            ));
        }
        if self.primary_gateway.enabled && self.primary_gateway.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "primary-gateway.url is required when the primary gateway is enabled".to_string(),
            ));
        }

        let mut problems = Vec::new();
        for provider in &self.provider.providers {
            for violation in validate_configuration(provider) {
                problems.push(format!("provider '{}': {}", provider.name, violation));
            }
        }
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems.join("; ")));
        }
        Ok(())
    }
}
