//! Configuration file support

use anyhow::{Context, Result};
use glossa_ai::{Provider, ProviderSettings};
use glossa_graph::{GraphConfig, ModelDefaults};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "llama3.1";
pub const DEFAULT_PROVIDER: &str = "ollama";

/// Configuration for glossa. Every field is optional; environment variables
/// take precedence over the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model, optionally `provider:model`
    pub model: Option<String>,
    /// Default provider (ollama, openai)
    pub provider: Option<String>,
    /// Knowledge store URL
    pub database_url: Option<String>,
    /// Deadline for a single non-streaming backend call, in seconds
    pub request_timeout_secs: Option<u64>,
    pub ollama: OllamaConfig,
    pub openai: OpenAiConfig,
    pub escalation: EscalationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub step: Option<u32>,
    pub max_tier: Option<u32>,
    pub base_tier: Option<u32>,
    pub max_needed_terms: Option<usize>,
}

/// Fully resolved settings the binary runs with
#[derive(Debug, Clone)]
pub struct Settings {
    pub defaults: ModelDefaults,
    pub providers: ProviderSettings,
    pub graph: GraphConfig,
    pub database_url: String,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("glossa")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("GLOSSA_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse config file");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
                Self::default()
            }
        }
    }

    /// Write the example config if no file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Resolve against the process environment
    pub fn resolve(&self) -> Result<Settings> {
        self.resolve_with(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Resolve with `env` standing in for the process environment
    pub fn resolve_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<Settings> {
        let model = env("DEFAULT_MODEL")
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let provider_tag = env("DEFAULT_PROVIDER")
            .or_else(|| self.provider.clone())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        let provider: Provider = provider_tag
            .parse()
            .with_context(|| format!("invalid default provider '{provider_tag}'"))?;

        let mut providers = ProviderSettings {
            openai_api_key: env("OPENAI_API_KEY").or_else(|| self.openai.api_key.clone()),
            ..Default::default()
        };
        if let Some(url) = env("OPENAI_BASE_URL").or_else(|| self.openai.base_url.clone()) {
            providers.openai_base_url = url;
        }
        if let Some(url) = env("OLLAMA_BASE_URL").or_else(|| self.ollama.base_url.clone()) {
            providers.ollama_base_url = url;
        }
        if let Some(secs) = self.request_timeout_secs {
            providers.request_timeout = Duration::from_secs(secs);
        }

        let base = GraphConfig::default();
        let graph = GraphConfig {
            escalation_step: self.escalation.step.unwrap_or(base.escalation_step),
            max_simplicity_tier: self.escalation.max_tier.unwrap_or(base.max_simplicity_tier),
            base_simplicity_tier: self.escalation.base_tier.unwrap_or(base.base_simplicity_tier),
            max_needed_terms: self
                .escalation
                .max_needed_terms
                .unwrap_or(base.max_needed_terms),
        };

        let database_url = env("DATABASE_URL")
            .or_else(|| self.database_url.clone())
            .unwrap_or_else(default_database_url);

        Ok(Settings {
            defaults: ModelDefaults::new(provider, model),
            providers,
            graph,
            database_url,
        })
    }
}

/// `sqlite:` URL under the user's data directory
pub fn default_database_url() -> String {
    let dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("glossa");
    format!("sqlite:{}", dir.join("knowledge.db").display())
}

/// Filesystem path of a file-backed `sqlite:` URL
pub fn sqlite_path(url: &str) -> Option<&Path> {
    if url.contains(":memory:") {
        return None;
    }
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty()).then(|| Path::new(path))
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# glossa configuration file
# Place at ~/.config/glossa/config.toml (Linux) or set GLOSSA_CONFIG_PATH.
# Environment variables (DEFAULT_MODEL, DEFAULT_PROVIDER, OLLAMA_BASE_URL,
# OPENAI_BASE_URL, OPENAI_API_KEY, DATABASE_URL) override these values.

# Default model; a provider prefix such as "openai:gpt-4o-mini" also selects the provider
model = "llama3.1"

# Default provider (ollama, openai)
provider = "ollama"

# Knowledge store
# database_url = "sqlite:/home/me/.local/share/glossa/knowledge.db"

# Deadline for one non-streaming backend call, in seconds
request_timeout_secs = 60

[ollama]
base_url = "http://localhost:11434"

[openai]
base_url = "https://api.openai.com/v1"
# It's recommended to use the OPENAI_API_KEY environment variable instead
# api_key = "sk-..."

[escalation]
step = 500
max_tier = 1000
base_tier = 0
max_needed_terms = 32
"#
}
