//! Configuration management for the relay.
//!
//! Configuration is loaded from a YAML file with `${VAR}` / `${VAR:-default}`
//! expansion, then selected fields are overridden from the environment.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use crate::transformer::Protocol;

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\$\{([^}:]+)(?::?-?([^}]*))?\}"#).expect("env var pattern is a valid regex")
});

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Keys accepted from callers. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Request timeout in seconds for backend calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Keep-alive cadence for streaming responses
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,

    #[serde(default)]
    pub quota_exceeded: QuotaExceededConfig,

    /// How often expired quota marks are swept from the model registry
    #[serde(default = "default_quota_cleanup_interval")]
    pub quota_cleanup_interval_secs: u64,

    /// Backend credentials making up the client pool
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

/// Behaviour when a backend credential reports a quota error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaExceededConfig {
    /// Fail over to the next credential on HTTP 429
    #[serde(default = "default_true")]
    pub switch_project: bool,

    /// How long a credential stays ineligible for a model after a 429
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for QuotaExceededConfig {
    fn default() -> Self {
        Self {
            switch_project: true,
            cooldown_secs: default_cooldown(),
        }
    }
}

/// One backend credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Stable identifier used in logs and quota bookkeeping
    pub id: String,

    /// Wire protocol this credential speaks
    pub provider: Protocol,

    #[serde(default)]
    pub api_key: Option<String>,

    /// OAuth access token (Gemini CLI, Codex)
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    /// Models served by this credential. Empty means the provider defaults.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// A model entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub input_token_limit: Option<u64>,
    #[serde(default)]
    pub output_token_limit: Option<u64>,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8317
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

fn default_keep_alive_interval_ms() -> u64 {
    500
}

fn default_cooldown() -> u64 {
    300
}

fn default_quota_cleanup_interval() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api_keys: vec![],
            request_timeout_secs: default_request_timeout(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            quota_exceeded: QuotaExceededConfig::default(),
            quota_cleanup_interval_secs: default_quota_cleanup_interval(),
            credentials: vec![],
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_relay_rust::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let expanded = expand_env_vars(&content);

        let mut config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(timeout) = std::env::var("REQUEST_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                self.request_timeout_secs = timeout;
            }
        }
    }

    /// Reject configurations the pool cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if credential.id.trim().is_empty() {
                bail!("credential id must not be empty");
            }
            if !seen.insert(credential.id.as_str()) {
                bail!("duplicate credential id: {}", credential.id);
            }
            if credential.api_key.is_none() && credential.access_token.is_none() {
                bail!(
                    "credential {} needs either api_key or access_token",
                    credential.id
                );
            }
        }
        if self.keep_alive_interval_ms == 0 {
            bail!("keep_alive_interval_ms must be positive");
        }
        if self.quota_exceeded.cooldown_secs == 0 {
            bail!("quota_exceeded.cooldown_secs must be positive");
        }
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.quota_exceeded.cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}
