use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Environment variable that supplies (or overrides) the bot token.
pub const BOT_TOKEN_ENV: &str = "BOT_TOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Page size requested from `/records`
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Maximum number of records shown in one reply
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            per_page: default_per_page(),
            max_results: default_max_results(),
        }
    }
}

impl ApiConfig {
    /// Base URL without a trailing slash.
    pub fn effective_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn default_base_url() -> String {
    "https://odd-meadow-68ee.batvalour-13d.workers.dev".to_string()
}

fn default_per_page() -> u32 {
    10
}

fn default_max_results() -> usize {
    5
}

impl Config {
    /// Load the config file if it exists, then apply the `BOT_TOKEN` override.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.with_token_override(std::env::var(BOT_TOKEN_ENV).ok())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML")
    }

    /// Apply an optional token from the environment; a non-empty value wins
    /// over the file. Fails if no token remains.
    pub fn with_token_override(mut self, env_token: Option<String>) -> Result<Self> {
        if let Some(token) = env_token.map(|t| t.trim().to_string()) {
            if !token.is_empty() {
                self.telegram.bot_token = token;
            }
        }

        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!(
                "No bot token configured: set {} or telegram.bot_token",
                BOT_TOKEN_ENV
            );
        }

        Ok(self)
    }
}
