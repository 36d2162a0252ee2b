//! glossa-graph: Knowledge-escalation orchestration
//!
//! Before answering, a run asks the model which known terms it needs,
//! resolves their definitions from a [`KnowledgeStore`], and raises the
//! simplicity tier while the model reports it needs more context. Terms the
//! model asked about but the store could not define are recorded back into
//! the store for later enrichment.

pub mod channel;
pub mod error;
pub mod events;
pub mod graph;
pub mod knowledge;
pub mod prompts;
pub mod resolve;
pub mod state;

pub use channel::{TokenEvent, TokenReceiver, TokenSender, token_channel};
pub use error::{Error, Result};
pub use events::{RunStream, StreamEvent};
pub use graph::{GraphConfig, KnowledgeGraph, Node, RunRequest};
pub use knowledge::{
    InMemoryKnowledgeStore, KnowledgeEntry, KnowledgeError, KnowledgeStore, NewKnowledge,
};
pub use resolve::{ModelDefaults, resolve_target};
pub use state::{ConversationState, RunOutput};

// Re-export the provider layer so consumers need only this crate
pub use glossa_ai;
