//! glossa-store: SQLite-backed knowledge store
//!
//! Implements [`glossa_graph::KnowledgeStore`] over a `memories` table keyed
//! by unique title.

mod sqlite;

pub use sqlite::SqliteKnowledgeStore;
