//! Error types for glossa-graph

use thiserror::Error;

use crate::knowledge::KnowledgeError;

/// Result type alias using glossa-graph Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can end (or be absorbed by) an orchestration run
#[derive(Error, Debug)]
pub enum Error {
    /// A provider was selected that cannot be used (e.g. missing credential)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A backend call failed
    #[error("Adapter call failed: {0}")]
    AdapterCall(#[source] glossa_ai::Error),

    /// A structured reply did not decode against its schema
    #[error("Structured output rejected: {0}")]
    SchemaValidation(String),

    /// The knowledge store failed
    #[error(transparent)]
    KnowledgeStore(#[from] KnowledgeError),

    /// The consumer went away or cancelled the run
    #[error("Stream closed by consumer")]
    StreamClosed,

    /// The token stream ended without its end marker
    #[error("Generation aborted: {0}")]
    Aborted(String),

    /// The run request was rejected before any node ran
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<glossa_ai::Error> for Error {
    fn from(error: glossa_ai::Error) -> Self {
        match error {
            glossa_ai::Error::SchemaValidation(msg) => Error::SchemaValidation(msg),
            glossa_ai::Error::InvalidRequest(msg) => Error::InvalidRequest(msg),
            e if e.is_configuration() => Error::Configuration(e.to_string()),
            e => Error::AdapterCall(e),
        }
    }
}

impl Error {
    /// Whether this error is the cancellation path rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::StreamClosed)
    }
}
