//! Settings from `<config_dir>/pgchat/config.toml`, overridable from the
//! environment (`.env` included). Every field has a default, so a missing
//! file is not an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    /// OpenAI-compatible endpoint; the public API when unset.
    pub api_base: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_base: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Schema namespace whose base tables are introspected.
    pub namespace: String,
    /// Parse generated SQL and reject unknown relations before executing.
    pub verify_identifiers: bool,
    /// Rows beyond this are left out of the narration prompt.
    pub max_narration_rows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            namespace: "public".to_string(),
            verify_identifiers: false,
            max_narration_rows: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            pipeline: PipelineConfig::default(),
            log_level: "warn".to_string(),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pgchat")
            .join("config.toml")
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid pgchat configuration")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Load the config file, then apply `.env` and environment overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::load_from(&Self::default_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("PGCHAT_MODEL").filter(|v| !v.is_empty()) {
            self.llm.model = model;
        }
        if let Some(base) = lookup("PGCHAT_API_BASE").filter(|v| !v.is_empty()) {
            self.llm.api_base = Some(base);
        }
    }

    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.llm.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .with_context(|| {
                format!(
                    "{} must be set in the environment or a .env file",
                    self.llm.api_key_env
                )
            })
    }
}
