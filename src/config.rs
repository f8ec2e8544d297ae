use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    /// Newest turns sent per generation. 0 means no limit.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// How often the pending-message queue is rechecked for a silence window
    /// that ended without a status change event.
    #[serde(default = "default_pending_recheck_secs")]
    pub pending_recheck_secs: u64,

    /// Request structured tool calls instead of inline directive tags.
    #[serde(default = "default_true")]
    pub use_tool_calls: bool,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_history_limit() -> usize {
    20
}

fn default_database_path() -> String {
    "riftlink.db".to_string()
}

fn default_pending_recheck_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            history_limit: default_history_limit(),
            database_path: default_database_path(),
            pending_recheck_secs: default_pending_recheck_secs(),
            use_tool_calls: true,
        }
    }
}

impl EngineConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("riftlink_config.toml")
    }

    /// Load from riftlink_config.toml next to the executable, falling back to
    /// defaults plus env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("RIFTLINK_LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("RIFTLINK_LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("RIFTLINK_LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(limit) = env::var("RIFTLINK_HISTORY_LIMIT") {
            if let Ok(limit) = limit.parse() {
                config.history_limit = limit;
            }
        }

        if let Ok(path) = env::var("RIFTLINK_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(secs) = env::var("RIFTLINK_PENDING_RECHECK_SECS") {
            if let Ok(secs) = secs.parse() {
                config.pending_recheck_secs = secs;
            }
        }

        if let Ok(enabled) = env::var("RIFTLINK_USE_TOOL_CALLS") {
            config.use_tool_calls = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.pending_recheck_secs, 60);
        assert!(config.use_tool_calls);
        assert!(config.llm_api_url.ends_with("/v1"));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: EngineConfig =
            toml::from_str("llm_model = \"qwen3\"\nhistory_limit = 0\n").expect("parse");
        assert_eq!(config.llm_model, "qwen3");
        assert_eq!(config.history_limit, 0);
        assert_eq!(config.database_path, "riftlink.db");
    }
}
