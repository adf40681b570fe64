use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub text: TextConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Connection settings for the hosted inference provider.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_account_id")]
    pub account_id: String,
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Applies to one-shot calls and to connection setup for streams.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            api_token_env: default_api_token_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn api_token(&self) -> String {
        std::env::var(&self.api_token_env).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct TextConfig {
    /// Used when a chat request carries no `systemPrompt` of its own.
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
}

// Defaults
fn default_bind() -> String {
    "0.0.0.0:8787".into()
}
fn default_account_id() -> String {
    std::env::var("CLOUDFLARE_ACCOUNT_ID").unwrap_or_default()
}
fn default_api_token_env() -> String {
    "CLOUDFLARE_API_TOKEN".into()
}
fn default_base_url() -> String {
    "https://api.cloudflare.com/client/v4".into()
}
fn default_timeout_secs() -> u64 {
    120
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider.account_id.is_empty() {
            return Err(Error::config(
                "CLOUDFLARE_ACCOUNT_ID not set. Export it or set provider.account_id in relay.toml",
            ));
        }
        if self.provider.timeout_secs == 0 {
            return Err(Error::config("provider.timeout_secs must be greater than zero"));
        }
        Ok(())
    }
}
