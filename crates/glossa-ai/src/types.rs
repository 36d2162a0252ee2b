//! Core types for LLM interactions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Backend providers a request can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Hosted API provider (OpenAI-compatible chat completions)
    Hosted,
    /// Local daemon provider (Ollama)
    Local,
}

impl Provider {
    /// Canonical tag used in `provider:model` identifiers
    pub fn tag(&self) -> &'static str {
        match self {
            Provider::Hosted => "openai",
            Provider::Local => "ollama",
        }
    }

    /// Get a human-readable name for this provider
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Hosted => "OpenAI",
            Provider::Local => "Ollama",
        }
    }

    /// Get the environment variable name for this provider's API key
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self {
            Provider::Hosted => Some("OPENAI_API_KEY"),
            Provider::Local => None,
        }
    }

    /// Parse a provider tag, returning `None` for unknown tags
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "openai" | "hosted" => Some(Provider::Hosted),
            "ollama" | "local" => Some(Provider::Local),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Provider::from_tag(s).ok_or_else(|| Error::UnsupportedProvider(s.to_string()))
    }
}

/// Message roles accepted from callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Function,
}

/// A raw conversational message as received from a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Roles both backends understand without tool-call metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A normalized message ready to be sent to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Normalize raw messages into the backend representation.
///
/// Tool and function messages carry no call ids here, so they are folded
/// into user turns.
pub fn normalize_messages(raw: &[Message]) -> Vec<ChatMessage> {
    raw.iter()
        .map(|m| ChatMessage {
            role: match m.role {
                Role::System => ChatRole::System,
                Role::Assistant => ChatRole::Assistant,
                Role::User | Role::Tool | Role::Function => ChatRole::User,
            },
            content: m.content.clone(),
        })
        .collect()
}

/// A single generation call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier, passed opaquely to the backend
    pub model: String,
    /// Normalized conversation
    pub messages: Vec<ChatMessage>,
    /// Provider-native temperature; never rescaled
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Reject requests that no backend would accept
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(Error::InvalidRequest("messages must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(Error::InvalidRequest("model must not be empty".into()));
        }
        Ok(())
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_tags_round_trip() {
        for p in [Provider::Hosted, Provider::Local] {
            assert_eq!(p.tag().parse::<Provider>().unwrap(), p);
        }
        assert_eq!("LOCAL".parse::<Provider>().unwrap(), Provider::Local);
        assert_eq!("hosted".parse::<Provider>().unwrap(), Provider::Hosted);
    }

    #[test]
    fn test_unknown_provider_tag() {
        assert!(Provider::from_tag("llama3.1").is_none());
        assert!(matches!(
            "anthropic".parse::<Provider>(),
            Err(Error::UnsupportedProvider(_))
        ));
    }

    #[test]
    fn test_normalize_folds_tool_roles_into_user() {
        let raw = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message {
                role: Role::Tool,
                content: "tool output".into(),
            },
            Message {
                role: Role::Function,
                content: "fn output".into(),
            },
        ];
        let roles: Vec<ChatRole> = normalize_messages(&raw).iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::System,
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::User,
                ChatRole::User
            ]
        );
    }

    #[test]
    fn test_request_validation() {
        assert!(ChatRequest::new("m", vec![]).validate().is_err());
        assert!(
            ChatRequest::new(" ", vec![ChatMessage::user("x")])
                .validate()
                .is_err()
        );
        assert!(
            ChatRequest::new("m", vec![ChatMessage::user("x")])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_role_serde() {
        let m: Message = serde_json::from_str(r#"{"role":"function","content":"x"}"#).unwrap();
        assert_eq!(m.role, Role::Function);
    }
}
