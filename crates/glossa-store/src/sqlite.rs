use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use glossa_graph::{KnowledgeError, KnowledgeStore, NewKnowledge};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Bound on bind parameters per `IN (...)` query
const MAX_BINDS: usize = 500;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL DEFAULT '',
    source_url TEXT,
    memory_simplicity INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
)
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_memories_simplicity ON memories (memory_simplicity)";

fn backend(e: sqlx::Error) -> KnowledgeError {
    KnowledgeError::Backend(e.to_string())
}

/// Knowledge store over an SQLite connection pool
#[derive(Debug, Clone)]
pub struct SqliteKnowledgeStore {
    pool: SqlitePool,
}

impl SqliteKnowledgeStore {
    /// Open (creating if missing) the database at `database_url` and make
    /// sure the table exists.
    pub async fn connect(database_url: &str) -> Result<Self, KnowledgeError> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| KnowledgeError::Backend(format!("invalid database URL: {e}")))?
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to an in-memory database is a separate database,
        // so those get exactly one connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(10)
                .idle_timeout(Duration::from_secs(30))
                .max_lifetime(Duration::from_secs(1800))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(backend)?;

        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        tracing::debug!(url = database_url, "knowledge store ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `memories` table if it does not exist
    pub async fn ensure_schema(&self) -> Result<(), KnowledgeError> {
        for statement in [CREATE_TABLE, CREATE_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    /// Insert or overwrite a definition, clearing any soft delete
    pub async fn define(
        &self,
        title: &str,
        content: &str,
        simplicity: u32,
    ) -> Result<(), KnowledgeError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO memories (title, content, memory_simplicity, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(title) DO UPDATE SET
                content = excluded.content,
                memory_simplicity = excluded.memory_simplicity,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
        )
        .bind(title)
        .bind(content)
        .bind(i64::from(simplicity))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Hide an entry from every read; returns whether a visible row was hidden
    pub async fn soft_delete(&self, title: &str) -> Result<bool, KnowledgeError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE memories SET deleted_at = ?, updated_at = ? WHERE title = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(title)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn list_titles(&self, max_simplicity: u32) -> Result<Vec<String>, KnowledgeError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT title FROM memories
            WHERE memory_simplicity <= ? AND deleted_at IS NULL
            ORDER BY title
            "#,
        )
        .bind(i64::from(max_simplicity))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }

    async fn fetch_definitions(
        &self,
        titles: &[String],
        max_simplicity: u32,
    ) -> Result<BTreeMap<String, String>, KnowledgeError> {
        let mut found = BTreeMap::new();
        for chunk in titles.chunks(MAX_BINDS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT title, content FROM memories \
                 WHERE title IN ({placeholders}) AND memory_simplicity <= ? AND deleted_at IS NULL"
            );
            let mut query = sqlx::query_as::<_, (String, String)>(&sql);
            for title in chunk {
                query = query.bind(title);
            }
            let rows = query
                .bind(i64::from(max_simplicity))
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            found.extend(rows);
        }
        Ok(found)
    }

    async fn upsert_if_absent(&self, batch: &[NewKnowledge]) -> Result<usize, KnowledgeError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0;

        // An early return drops `tx`, which rolls the whole batch back.
        for item in batch {
            let title = item.title.trim();
            if title.is_empty() {
                continue;
            }
            let result = sqlx::query(
                r#"
                INSERT INTO memories (title, content, memory_simplicity, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(title) DO NOTHING
                "#,
            )
            .bind(title)
            .bind(&item.content)
            .bind(i64::from(item.simplicity))
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| KnowledgeError::Transaction(e.to_string()))?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| KnowledgeError::Transaction(e.to_string()))?;
        tracing::debug!(inserted, batch = batch.len(), "upserted knowledge batch");
        Ok(inserted)
    }
}
