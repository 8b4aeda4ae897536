//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API key, login cookie) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub platform: PlatformConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Site name used in offer messages.
    pub site_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    /// The agent's own SteamID64.
    pub steam_id: String,
    pub api_key_env: String,
    /// Env var holding the `steamLoginSecure` cookie value.
    pub login_cookie_env: String,
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    #[serde(default = "default_context_id")]
    pub context_id: u64,
}

fn default_app_id() -> u32 {
    crate::types::CSGO_APP_ID
}

fn default_context_id() -> u64 {
    crate::types::CSGO_CONTEXT_ID
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// e.g. `sqlite://offerkeeper.db`
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_database_url() -> String {
    "sqlite://offerkeeper.db".to_string()
}

/// Retry timing. Defaults match the platform's observed recovery times.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub session_delay_secs: u64,
    pub transient_delay_secs: u64,
    pub unavailable_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            session_delay_secs: 10,
            transient_delay_secs: 10,
            unavailable_delay_secs: 20,
            max_delay_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PollerConfig {
    pub interval_secs: u64,
    /// How far back the first poll looks when no checkpoint exists.
    pub initial_lookback_secs: i64,
    pub channel_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            initial_lookback_secs: 1800,
            channel_capacity: 256,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Allowed CORS origin for the site front-end.
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
    /// Issuance requests buffered ahead of the issue worker.
    #[serde(default = "default_issue_queue_capacity")]
    pub issue_queue_capacity: usize,
}

fn default_allowed_origin() -> String {
    "*".to_string()
}

fn default_issue_queue_capacity() -> usize {
    64
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Resolve a secret env var, keeping the value out of Debug output.
    pub fn resolve_secret(env_name: &str) -> Result<SecretString> {
        Self::resolve_env(env_name).map(SecretString::new)
    }
}
