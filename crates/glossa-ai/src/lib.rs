//! glossa-ai: Uniform call/stream interface over LLM backends
//!
//! This crate provides one capability, [`LlmProvider`], with two concrete
//! variants: a hosted provider speaking the OpenAI chat completions protocol
//! and a local provider talking to an Ollama daemon.

pub mod error;
pub mod providers;
pub mod stream;
pub mod structured;
pub mod types;

pub use error::{Error, Result};
pub use providers::{LlmProvider, ProviderSettings, Providers};
pub use stream::{DeltaEvent, DeltaStream, TextAccumulator};
pub use structured::StructuredSchema;
pub use types::*;
