//! Per-run conversation state

use std::collections::BTreeMap;

use glossa_ai::{ChatMessage, Message, Provider, normalize_messages};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single mutable record threaded through one run.
///
/// Owned exclusively by the run that created it; the graph passes it to each
/// node by `&mut`.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub run_id: Uuid,
    pub provider: Provider,
    pub model: String,
    pub raw_messages: Vec<Message>,
    pub normalized_messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub stream_requested: bool,
    pub simplicity_tier: u32,
    pub known_terms: Vec<String>,
    /// Tier `known_terms` was fetched at, if fetched
    pub known_terms_tier: Option<u32>,
    pub needed_terms: Vec<String>,
    /// Every title ever placed in `needed_terms`, in first-seen order
    pub requested_terms: Vec<String>,
    pub resolved_meanings: BTreeMap<String, String>,
    pub answer: String,
    pub needs_more_context: bool,
    pub new_terms: Vec<String>,
    /// Number of assessments made so far
    pub iterations: u32,
    pub error: Option<String>,
}

impl ConversationState {
    pub fn new(
        provider: Provider,
        model: impl Into<String>,
        raw_messages: Vec<Message>,
        temperature: Option<f32>,
        stream_requested: bool,
        base_tier: u32,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            provider,
            model: model.into(),
            raw_messages,
            normalized_messages: Vec::new(),
            temperature,
            stream_requested,
            simplicity_tier: base_tier,
            known_terms: Vec::new(),
            known_terms_tier: None,
            needed_terms: Vec::new(),
            requested_terms: Vec::new(),
            resolved_meanings: BTreeMap::new(),
            answer: String::new(),
            needs_more_context: false,
            new_terms: Vec::new(),
            iterations: 0,
            error: None,
        }
    }

    /// Rebuild the backend representation from the raw input
    pub fn normalize(&mut self) {
        self.normalized_messages = normalize_messages(&self.raw_messages);
    }

    /// The conversation with `context` appended as a trailing system message
    pub fn with_context(&self, context: Option<String>) -> Vec<ChatMessage> {
        let mut messages = self.normalized_messages.clone();
        if let Some(context) = context {
            messages.push(ChatMessage::system(context));
        }
        messages
    }

    /// Whether known terms must be (re)fetched for the current tier
    pub fn known_terms_stale(&self) -> bool {
        self.known_terms_tier != Some(self.simplicity_tier)
    }

    /// Replace `needed_terms` with the sanitized union of `terms`, recording
    /// each in `requested_terms`.
    pub fn request_terms<I, S>(&mut self, terms: I, limit: usize)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut needed: Vec<String> = Vec::new();
        for term in terms {
            let term = term.as_ref().trim();
            if term.is_empty() || needed.iter().any(|t| t == term) {
                continue;
            }
            if needed.len() == limit {
                break;
            }
            needed.push(term.to_string());
        }
        for term in &needed {
            if !self.requested_terms.contains(term) {
                self.requested_terms.push(term.clone());
            }
        }
        self.needed_terms = needed;
    }

    /// Merge fetched definitions for the currently needed terms and clear them.
    ///
    /// Titles that were not requested are ignored so resolved keys always stay
    /// within `requested_terms`.
    pub fn resolve(&mut self, found: BTreeMap<String, String>) -> usize {
        let mut merged = 0;
        for (title, definition) in found {
            if self.needed_terms.contains(&title) {
                self.resolved_meanings.insert(title, definition);
                merged += 1;
            }
        }
        self.needed_terms.clear();
        merged
    }

    /// Raise the tier by `step`, never past `max`
    pub fn escalate(&mut self, step: u32, max: u32) {
        self.simplicity_tier = self.simplicity_tier.saturating_add(step).min(max);
    }

    /// Requested titles that never resolved
    pub fn unresolved_terms(&self) -> Vec<String> {
        self.requested_terms
            .iter()
            .filter(|t| !self.resolved_meanings.contains_key(*t))
            .cloned()
            .collect()
    }

    pub fn into_output(self) -> RunOutput {
        RunOutput {
            run_id: self.run_id,
            provider: self.provider,
            model: self.model,
            answer: self.answer,
            resolved_terms: self.resolved_meanings.into_keys().collect(),
            new_terms: self.new_terms,
            simplicity_tier: self.simplicity_tier,
            error: self.error,
        }
    }
}

/// Public fields of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub provider: Provider,
    pub model: String,
    pub answer: String,
    pub resolved_terms: Vec<String>,
    pub new_terms: Vec<String>,
    pub simplicity_tier: u32,
    /// Non-fatal fault recorded after the answer was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ConversationState {
        ConversationState::new(
            Provider::Local,
            "llama3.1",
            vec![Message::system("be brief"), Message::user("what is a sheaf?")],
            None,
            false,
            0,
        )
    }

    #[test]
    fn test_with_context_appends_system_message() {
        let mut s = state();
        s.normalize();
        assert_eq!(s.with_context(None).len(), 2);
        let messages = s.with_context(Some("- foo: bar".into()));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], ChatMessage::system("- foo: bar"));
        assert_eq!(s.normalized_messages.len(), 2);
    }

    #[test]
    fn test_request_terms_sanitizes() {
        let mut s = state();
        s.request_terms(["foo", " foo ", "", "bar", "baz"], 2);
        assert_eq!(s.needed_terms, vec!["foo", "bar"]);
        s.request_terms(["qux", "foo"], 8);
        assert_eq!(s.needed_terms, vec!["qux", "foo"]);
        assert_eq!(s.requested_terms, vec!["foo", "bar", "qux"]);
    }

    #[test]
    fn test_resolve_only_keeps_requested_titles() {
        let mut s = state();
        s.request_terms(["foo", "bar"], 8);
        let mut found = BTreeMap::new();
        found.insert("foo".to_string(), "a foo".to_string());
        found.insert("stray".to_string(), "not asked for".to_string());
        assert_eq!(s.resolve(found), 1);
        assert!(s.needed_terms.is_empty());
        assert_eq!(s.resolved_meanings.len(), 1);
        assert_eq!(s.unresolved_terms(), vec!["bar"]);
    }

    #[test]
    fn test_resolve_last_write_wins() {
        let mut s = state();
        s.request_terms(["foo"], 8);
        s.resolve(BTreeMap::from([("foo".to_string(), "old".to_string())]));
        s.request_terms(["foo"], 8);
        s.resolve(BTreeMap::from([("foo".to_string(), "new".to_string())]));
        assert_eq!(s.resolved_meanings["foo"], "new");
    }

    #[test]
    fn test_escalate_caps_at_max() {
        let mut s = state();
        s.escalate(600, 1000);
        assert_eq!(s.simplicity_tier, 600);
        s.escalate(600, 1000);
        assert_eq!(s.simplicity_tier, 1000);
        s.escalate(600, 1000);
        assert_eq!(s.simplicity_tier, 1000);
    }

    #[test]
    fn test_known_terms_staleness() {
        let mut s = state();
        assert!(s.known_terms_stale());
        s.known_terms_tier = Some(0);
        assert!(!s.known_terms_stale());
        s.escalate(500, 1000);
        assert!(s.known_terms_stale());
    }
}
