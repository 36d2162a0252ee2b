//! Error types for glossa-ai

use thiserror::Error;

use crate::types::Provider;

/// Result type alias using glossa-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when calling a provider
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed (includes per-call timeouts)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// The backend rejected a request parameter it does not support
    #[error("Unsupported parameter '{param}': {message}")]
    UnsupportedParameter { param: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// No credential configured for the selected provider
    #[error("Missing API key for provider {provider}")]
    MissingApiKey { provider: Provider },

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Structured output did not match the requested schema
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    /// Model not found
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Request rejected before it was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider not registered
    #[error("Provider not configured: {0}")]
    UnsupportedProvider(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the provider is not usable at all with the
    /// current configuration (as opposed to a failed call).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MissingApiKey { .. } | Error::UnsupportedProvider(_)
        )
    }
}
