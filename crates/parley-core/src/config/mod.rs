//! Configuration module for parley.
//!
//! Loads typed configuration from `~/.parley/config.json`.
//! All fields use `serde` defaults so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub generator: GeneratorDefaults,
    /// Allow prompting for missing credentials on a terminal.
    pub interactive: bool,
}

impl Config {
    /// Load configuration from the default path (`~/.parley/config.json`).
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Get the default config directory path.
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".parley")
    }

    /// Write the default config template to `path`.
    pub fn write_default_template(path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = serde_json::json!({
            "providers": {
                "openai": {
                    "apiKey": "sk-YOUR_KEY_HERE"
                }
            },
            "generator": {
                "provider": "openai",
                "model": "gpt-4o"
            },
            "interactive": true
        });

        std::fs::write(path, serde_json::to_string_pretty(&template)?)?;
        Ok(())
    }
}

// ── Provider Configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderEntry {
    pub api_key: String,
    pub api_base: Option<String>,
    /// Context window for models the adapter does not know.
    pub token_limit: Option<usize>,
    pub secret: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: Option<ProviderEntry>,
    pub anthropic: Option<ProviderEntry>,
}

impl ProvidersConfig {
    /// Configured entries keyed by provider name.
    pub fn entries(&self) -> HashMap<String, ProviderEntry> {
        [("openai", &self.openai), ("anthropic", &self.anthropic)]
            .into_iter()
            .filter_map(|(name, entry)| entry.clone().map(|e| (name.to_string(), e)))
            .collect()
    }

    /// Find the first configured provider (has a non-empty API key).
    pub fn find_active(&self) -> Option<(&str, &ProviderEntry)> {
        [("openai", &self.openai), ("anthropic", &self.anthropic)]
            .into_iter()
            .find_map(|(name, entry)| match entry {
                Some(e) if !e.api_key.is_empty() => Some((name, e)),
                _ => None,
            })
    }
}

// ── Generator Configuration ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneratorDefaults {
    pub provider: String,
    pub model: String,
    pub token_limit_tolerance: usize,
    pub trial_count: u32,
    pub retry_delay_ms: u64,
    pub verbose: bool,
}

impl Default for GeneratorDefaults {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            token_limit_tolerance: 1024,
            trial_count: 5,
            retry_delay_ms: 500,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.generator.model, "gpt-4o");
        assert_eq!(config.generator.token_limit_tolerance, 1024);
        assert_eq!(config.generator.trial_count, 5);
        assert!(!config.interactive);
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let json = r#"{"providers": {"anthropic": {"apiKey": "sk-ant-xxx"}}, "generator": {"trialCount": 2}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let entry = config.providers.anthropic.as_ref().unwrap();
        assert_eq!(entry.api_key, "sk-ant-xxx");
        assert_eq!(config.generator.trial_count, 2);
        assert_eq!(config.generator.retry_delay_ms, 500);

        let (name, _) = config.providers.find_active().unwrap();
        assert_eq!(name, "anthropic");
    }

    #[test]
    fn test_deserialize_token_limit() {
        let json = r#"{"providers": {"openai": {"apiBase": "http://localhost:8000/v1", "tokenLimit": 32768}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let entry = config.providers.openai.as_ref().unwrap();
        assert_eq!(entry.token_limit, Some(32768));
        assert!(config.providers.anthropic.is_none());
    }

    #[test]
    fn test_write_and_load_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        Config::write_default_template(&path).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.interactive);
        assert_eq!(config.generator.provider, "openai");
        assert!(config.providers.entries().contains_key("openai"));
    }
}
