//! Provider and model resolution
//!
//! A model identifier may carry a provider prefix, `openai:gpt-4o-mini` or
//! `ollama:llama3.1`. Only known provider tags count as a prefix, so Ollama
//! model tags such as `llama3.1:8b` pass through untouched.
//!
//! Precedence for the provider: explicit parameter, then prefix tag, then the
//! configured default.

use glossa_ai::Provider;

use crate::error::{Error, Result};

/// Fallback provider and model used when a request names neither
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDefaults {
    pub provider: Provider,
    pub model: String,
}

impl ModelDefaults {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self::new(Provider::Local, "llama3.1")
    }
}

/// Split a known `provider:` prefix off a model identifier
pub fn split_prefix(id: &str) -> (Option<Provider>, &str) {
    if let Some((tag, rest)) = id.split_once(':') {
        if let Some(provider) = Provider::from_tag(tag) {
            return (Some(provider), rest.trim());
        }
    }
    (None, id.trim())
}

/// Resolve the provider and bare model name for a run
pub fn resolve_target(
    model: Option<&str>,
    provider: Option<&str>,
    defaults: &ModelDefaults,
) -> Result<(Provider, String)> {
    let explicit = match provider.map(str::trim).filter(|p| !p.is_empty()) {
        Some(tag) => Some(
            Provider::from_tag(tag)
                .ok_or_else(|| Error::InvalidRequest(format!("unknown provider '{tag}'")))?,
        ),
        None => None,
    };

    let (default_prefix, default_model) = split_prefix(&defaults.model);
    let fallback = default_prefix.unwrap_or(defaults.provider);

    let (prefix, name) = match model.map(str::trim).filter(|m| !m.is_empty()) {
        Some(id) => split_prefix(id),
        None => (default_prefix, default_model),
    };

    if name.is_empty() {
        return Err(Error::InvalidRequest("model must not be empty".into()));
    }

    Ok((explicit.or(prefix).unwrap_or(fallback), name.to_string()))
}
