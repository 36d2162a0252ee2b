//! LLM Provider implementations

pub mod hosted;
pub mod local;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{ChatRequest, DeltaStream, Error, Provider, Result, StructuredSchema};

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Which backend this provider talks to
    fn kind(&self) -> Provider;

    /// Run a non-streaming completion and return the raw output text.
    ///
    /// When `schema` is given the backend is asked for output constrained to it.
    async fn complete(
        &self,
        request: &ChatRequest,
        schema: Option<&StructuredSchema>,
    ) -> Result<String>;

    /// Stream a completion as ordered delta events
    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream>;

    /// List model identifiers the backend offers
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Run a structured completion and decode it against `schema`
    async fn complete_structured(
        &self,
        request: &ChatRequest,
        schema: &StructuredSchema,
    ) -> Result<serde_json::Value> {
        let raw = self.complete(request, Some(schema)).await?;
        schema.decode(&raw)
    }
}

/// Connection settings for the concrete providers
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub ollama_base_url: String,
    /// Deadline for a single non-streaming call
    pub request_timeout: Duration,
    /// Deadline for establishing a connection (streams included)
    pub connect_timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Build a pooled HTTP client shared by every call of one provider
pub(crate) fn build_client(settings: &ProviderSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(Error::from)
}

/// Registry of configured providers, shared by all runs
#[derive(Clone, Default)]
pub struct Providers {
    providers: HashMap<Provider, Arc<dyn LlmProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the concrete providers from settings.
    ///
    /// The local provider is always registered; the hosted one only when a
    /// credential is available.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let mut providers = Self::new();
        providers.register(Arc::new(local::LocalProvider::new(settings)?));
        if let Some(ref key) = settings.openai_api_key {
            providers.register(Arc::new(hosted::HostedProvider::new(key, settings)?));
        } else {
            tracing::debug!("No OpenAI API key configured; hosted provider disabled");
        }
        Ok(providers)
    }

    /// Register a provider under its own kind, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Look up the provider for a kind
    pub fn get(&self, kind: Provider) -> Result<Arc<dyn LlmProvider>> {
        match self.providers.get(&kind) {
            Some(p) => Ok(Arc::clone(p)),
            None if kind.api_key_env_var().is_some() => {
                Err(Error::MissingApiKey { provider: kind })
            }
            None => Err(Error::UnsupportedProvider(kind.tag().to_string())),
        }
    }

    pub fn contains(&self, kind: Provider) -> bool {
        self.providers.contains_key(&kind)
    }
}
