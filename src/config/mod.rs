//! # Configuration Management Module
//!
//! TOML configuration for the experience engine, split into three sections:
//!
//! - [`EngineConfig`] - content root, state directory, admin prefix, default experience
//! - [`LlmConfig`] - interpreter endpoint and call limits
//! - [`LoggingConfig`] - log level and log files
//!
//! ## Usage
//!
//! ```rust,no_run
//! use experience_engine::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Experiences: {}", config.engine.content_root);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [engine]
//! content_root = "./experiences"
//! data_dir = "./data/state"
//! admin_prefix = "@"
//! default_experience = ""
//!
//! [llm]
//! enabled = true
//! endpoint = "http://localhost:1234/v1/chat/completions"
//! model = "local-model"
//! api_key = ""
//! temperature = 0.2
//! timeout_seconds = 30
//!
//! [logging]
//! level = "info"
//! file = "experience-engine.log"
//! security_file = "experience-engine-security.log"
//! ```
//!
//! Per-experience settings live next to each experience's content in
//! `experience.toml`, not here.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one sub-directory per experience.
    pub content_root: String,
    /// Sled database directory for world and player records.
    pub data_dir: String,
    /// Prefix marking admin commands. Only a small fixed set is accepted.
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,
    /// Experience used when a message arrives with none bound. Empty disables the fallback.
    #[serde(default)]
    pub default_experience: String,
}

fn default_admin_prefix() -> String {
    "@".to_string()
}

/// Admin prefixes that cannot collide with ordinary speech.
pub const ALLOWED_ADMIN_PREFIXES: &[&str] = &["@", "/", "!", "#", "^"];

impl EngineConfig {
    pub fn default_experience(&self) -> Option<&str> {
        let trimmed = self.default_experience.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    /// OpenAI-compatible chat completions URL.
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound on a single interpreter call.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_timeout_seconds() -> u64 {
    30
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:1234/v1/chat/completions".to_string(),
            model: "local-model".to_string(),
            api_key: String::new(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    /// Separate file for `security`-target records (forbidden admin attempts).
    #[serde(default)]
    pub security_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("experience-engine.log".to_string()),
            security_file: Some("experience-engine-security.log".to_string()),
        }
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.content_root.trim().is_empty() {
            return Err(anyhow!("engine.content_root must not be empty"));
        }
        if self.engine.data_dir.trim().is_empty() {
            return Err(anyhow!("engine.data_dir must not be empty"));
        }
        if !ALLOWED_ADMIN_PREFIXES.contains(&self.engine.admin_prefix.as_str()) {
            return Err(anyhow!(
                "engine.admin_prefix '{}' is not one of {:?}",
                self.engine.admin_prefix,
                ALLOWED_ADMIN_PREFIXES
            ));
        }
        if let Some(id) = self.engine.default_experience() {
            crate::validation::validate_identifier(id)
                .map_err(|e| anyhow!("engine.default_experience '{}': {}", id, e))?;
        }
        if self.llm.enabled && self.llm.endpoint.trim().is_empty() {
            return Err(anyhow!("llm.endpoint is required when llm.enabled = true"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow!("llm.temperature must be between 0.0 and 2.0"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineConfig {
                content_root: "./experiences".to_string(),
                data_dir: "./data/state".to_string(),
                admin_prefix: default_admin_prefix(),
                default_experience: String::new(),
            },
            llm: LlmConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
