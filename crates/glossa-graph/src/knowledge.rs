//! Knowledge store contract and an in-memory implementation
//!
//! The store holds titled definitions, each gated by a simplicity tier: a
//! run at tier `t` only sees entries whose simplicity is `<= t`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a knowledge store
#[derive(Error, Debug)]
pub enum KnowledgeError {
    /// The backend failed a read or write
    #[error("Knowledge store error: {0}")]
    Backend(String),

    /// A batch write was rolled back
    #[error("Knowledge store transaction rolled back: {0}")]
    Transaction(String),
}

/// A stored knowledge entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub title: String,
    pub content: String,
    pub simplicity: u32,
}

/// A term to insert when absent. `content` may be empty, to be filled in later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKnowledge {
    pub title: String,
    pub content: String,
    pub simplicity: u32,
}

impl NewKnowledge {
    /// A bare title with no definition yet
    pub fn title_only(title: impl Into<String>, simplicity: u32) -> Self {
        Self {
            title: title.into(),
            content: String::new(),
            simplicity,
        }
    }
}

/// Read/write interface to the titled-knowledge collection.
///
/// Implementations must be safe for concurrent use by many runs.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// All titles with simplicity `<= max_simplicity`, unique and ordered by title
    async fn list_titles(&self, max_simplicity: u32) -> Result<Vec<String>, KnowledgeError>;

    /// Definitions for `titles` within the simplicity bound. Unknown titles are absent.
    async fn fetch_definitions(
        &self,
        titles: &[String],
        max_simplicity: u32,
    ) -> Result<BTreeMap<String, String>, KnowledgeError>;

    /// Insert every entry whose title does not exist yet; returns how many were
    /// inserted. The batch commits or rolls back as a whole.
    async fn upsert_if_absent(&self, batch: &[NewKnowledge]) -> Result<usize, KnowledgeError>;
}

/// Process-local store, used when no database is configured and in tests
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    entries: RwLock<BTreeMap<String, KnowledgeEntry>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry
    pub fn insert(&self, title: impl Into<String>, content: impl Into<String>, simplicity: u32) {
        let title = title.into();
        self.entries.write().insert(
            title.clone(),
            KnowledgeEntry {
                title,
                content: content.into(),
                simplicity,
            },
        );
    }

    pub fn get(&self, title: &str) -> Option<KnowledgeEntry> {
        self.entries.read().get(title).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn list_titles(&self, max_simplicity: u32) -> Result<Vec<String>, KnowledgeError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.simplicity <= max_simplicity)
            .map(|e| e.title.clone())
            .collect())
    }

    async fn fetch_definitions(
        &self,
        titles: &[String],
        max_simplicity: u32,
    ) -> Result<BTreeMap<String, String>, KnowledgeError> {
        let entries = self.entries.read();
        Ok(titles
            .iter()
            .filter_map(|t| entries.get(t))
            .filter(|e| e.simplicity <= max_simplicity)
            .map(|e| (e.title.clone(), e.content.clone()))
            .collect())
    }

    async fn upsert_if_absent(&self, batch: &[NewKnowledge]) -> Result<usize, KnowledgeError> {
        // One write lock for the whole batch keeps it atomic.
        let mut entries = self.entries.write();
        let mut inserted = 0;
        for item in batch {
            let title = item.title.trim();
            if title.is_empty() || entries.contains_key(title) {
                continue;
            }
            entries.insert(
                title.to_string(),
                KnowledgeEntry {
                    title: title.to_string(),
                    content: item.content.clone(),
                    simplicity: item.simplicity,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }
}
