use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub progress: ProgressConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Read the TOML file if it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                toml::from_str::<Config>(&raw)
                    .with_context(|| format!("parse config {}", path.display()))?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = dotenvy::var("OPENAI_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(base) = dotenvy::var("OPENAI_BASE_URL") {
            self.llm.api_base = base;
        }
        if let Ok(model) = dotenvy::var("AI_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = dotenvy::var("DATABASE_URL") {
            self.database.url = url;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Serve over TLS when both the certificate and key are set.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://database/dev_tutor.db".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub max_output_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            max_output_tokens: 500,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

/// How generous the progress rubric is when crediting a module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leniency {
    #[default]
    Liberal,
    Conservative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Quiet period after the last message before a check runs.
    pub debounce_ms: u64,
    /// Conversation length (user and assistant messages) required before any check.
    pub min_total_messages: usize,
    /// Messages that must accumulate since the previous check.
    pub min_new_messages: usize,
    /// A verdict advances the course only when its confidence is strictly above this.
    pub confidence_threshold: f32,
    pub leniency: Leniency,
    /// Most recent turns sent to the analyzer.
    pub window_turns: usize,
    /// Per-turn character cap inside the analysis window.
    pub turn_char_limit: usize,
    pub analysis_token_budget: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            min_total_messages: 4,
            min_new_messages: 2,
            confidence_threshold: 0.6,
            leniency: Leniency::Liberal,
            window_turns: 10,
            turn_char_limit: 1000,
            analysis_token_budget: 3000,
        }
    }
}

impl ProgressConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub max_sessions: u64,
    /// Recent messages rendered into the tutoring instruction.
    pub history_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            max_sessions: 1000,
            history_window: 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [progress]
            confidence_threshold = 0.75
            leniency = "conservative"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.progress.confidence_threshold, 0.75);
        assert_eq!(config.progress.leniency, Leniency::Conservative);
        assert_eq!(config.progress.min_total_messages, 4);
        assert_eq!(config.llm.max_output_tokens, 500);
    }

    #[test]
    fn api_key_is_not_printed() {
        let mut llm = LlmConfig::default();
        llm.api_key = "sk-secret".to_string();
        assert!(!format!("{:?}", llm).contains("sk-secret"));
    }
}
