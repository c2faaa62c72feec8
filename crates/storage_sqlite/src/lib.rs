mod keywords;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use core_types::{
    ChatMessage, Conversation, ConversationId, DEFAULT_CONVERSATION_TITLE, MessageRole,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub use keywords::{estimate_tokens, extract_keywords};

pub const CURRENT_DB_SCHEMA_VERSION: u32 = 1;

const MESSAGE_COLUMNS: &str =
    "m.id, m.conversation_id, m.role, m.content, m.tokens, m.keywords_json, m.timestamp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("conversation {0} does not exist")]
    ConversationNotFound(ConversationId),
}

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().to_string_lossy()
        ))?
        .create_if_missing(true)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tokens INTEGER NOT NULL,
                keywords_json TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_keywords (
                message_id INTEGER NOT NULL,
                keyword TEXT NOT NULL,
                PRIMARY KEY(message_id, keyword),
                FOREIGN KEY(message_id) REFERENCES messages(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_message_keywords_keyword ON message_keywords(keyword)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO metadata(key, value)
            VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CURRENT_DB_SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;
        let version = row.get::<String, _>("value").parse::<u32>()?;
        Ok(version)
    }

    pub async fn create_conversation(&self, title: Option<&str>) -> Result<ConversationId> {
        let title = title.unwrap_or(DEFAULT_CONVERSATION_TITLE);
        // updated_at is kept strictly increasing across conversations so recency
        // ordering never depends on two writes landing in the same millisecond.
        let row = sqlx::query(
            r#"
            INSERT INTO conversations(title, updated_at)
            SELECT ?1, MAX(?2, COALESCE(MAX(updated_at), 0) + 1) FROM conversations
            RETURNING id
            "#,
        )
        .bind(title)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        let id: ConversationId = row.get("id");
        debug!(conversation_id = id, title, "created conversation");
        Ok(id)
    }

    pub async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT id, title, updated_at FROM conversations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_conversation_row).transpose()
    }

    pub async fn save_message(
        &self,
        conversation_id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<ChatMessage> {
        let tokens = estimate_tokens(content);
        let keywords = extract_keywords(content);
        let timestamp = Utc::now();

        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?1")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::ConversationNotFound(conversation_id).into());
        }

        let id = sqlx::query(
            r#"
            INSERT INTO messages(conversation_id, role, content, tokens, keywords_json, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(conversation_id)
        .bind(serde_json::to_string(&role)?)
        .bind(content)
        .bind(tokens as i64)
        .bind(serde_json::to_string(&keywords)?)
        .bind(timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for keyword in &keywords {
            sqlx::query("INSERT OR IGNORE INTO message_keywords(message_id, keyword) VALUES (?1, ?2)")
                .bind(id)
                .bind(keyword)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE conversations
            SET updated_at = MAX(?2, (SELECT COALESCE(MAX(updated_at), 0) + 1 FROM conversations))
            WHERE id = ?1
            "#,
        )
        .bind(conversation_id)
        .bind(timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(conversation_id, message_id = id, tokens, "saved message");

        Ok(ChatMessage {
            id,
            conversation_id,
            role,
            content: content.to_string(),
            tokens,
            keywords,
            timestamp,
        })
    }

    pub async fn get_conversation_history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            WHERE m.conversation_id = ?1
            ORDER BY m.timestamp ASC, m.id ASC
            "#
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_message_row).collect()
    }

    pub async fn get_recent_conversations(&self, limit: Option<u32>) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, updated_at
            FROM conversations
            ORDER BY updated_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit.unwrap_or(20)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_conversation_row).collect()
    }

    pub async fn update_conversation_title(
        &self,
        conversation_id: ConversationId,
        title: &str,
    ) -> Result<()> {
        let updated = sqlx::query("UPDATE conversations SET title = ?2 WHERE id = ?1")
            .bind(conversation_id)
            .bind(title)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StorageError::ConversationNotFound(conversation_id).into());
        }
        Ok(())
    }

    /// Removes the conversation and every message in it as one transaction.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM message_keywords
            WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?1)
            "#,
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        let messages = sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(conversation_id, messages, "deleted conversation");
        Ok(())
    }

    pub async fn find_messages_by_keywords(&self, keywords: &[String]) -> Result<Vec<ChatMessage>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT DISTINCT {MESSAGE_COLUMNS} FROM messages m \
             JOIN message_keywords k ON k.message_id = m.id \
             WHERE k.keyword IN ("
        ));
        let mut separated = builder.separated(", ");
        for keyword in keywords {
            separated.push_bind(keyword.as_str());
        }
        separated.push_unseparated(") ORDER BY m.timestamp ASC, m.id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(map_message_row).collect()
    }

    pub async fn message_count(&self, conversation_id: ConversationId) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM messages WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }
}

fn map_conversation_row(row: SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.get("id"),
        title: row.get("title"),
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

fn map_message_row(row: SqliteRow) -> Result<ChatMessage> {
    let role_str: String = row.get("role");
    let role: MessageRole =
        serde_json::from_str(&role_str).context("invalid role in database")?;
    let keywords_json: String = row.get("keywords_json");
    let keywords: Vec<String> =
        serde_json::from_str(&keywords_json).context("invalid keywords in database")?;
    Ok(ChatMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role,
        content: row.get("content"),
        tokens: row.get::<i64, _>("tokens").max(0) as usize,
        keywords,
        timestamp: from_millis(row.get("timestamp"))?,
    })
}

fn from_millis(value: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(value)
        .with_context(|| format!("timestamp {value} out of range"))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn creates_and_reads_conversation_messages() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let schema_version = storage.schema_version().await.expect("schema version");
        assert_eq!(schema_version, CURRENT_DB_SCHEMA_VERSION);

        let id = storage.create_conversation(None).await.expect("conversation");
        let conversation = storage
            .get_conversation(id)
            .await
            .expect("lookup")
            .expect("conversation exists");
        assert_eq!(conversation.title, DEFAULT_CONVERSATION_TITLE);

        let saved = storage
            .save_message(id, MessageRole::User, "Explain tokio runtime internals")
            .await
            .expect("save message");
        assert_eq!(saved.tokens, estimate_tokens("Explain tokio runtime internals"));
        assert_eq!(saved.keywords, vec!["explain", "tokio", "runtime", "internals"]);

        storage
            .save_message(id, MessageRole::Assistant, "It is a work-stealing scheduler.")
            .await
            .expect("save reply");

        let history = storage.get_conversation_history(id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[0].keywords, saved.keywords);
        assert!(history[0].timestamp <= history[1].timestamp);
    }

    #[tokio::test]
    async fn rejects_messages_for_missing_conversation() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let err = storage
            .save_message(42, MessageRole::User, "orphan")
            .await
            .expect_err("must fail");
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::ConversationNotFound(42))
        );
        assert_eq!(storage.message_count(42).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn recent_conversations_are_newest_first() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let a = storage.create_conversation(Some("A")).await.expect("a");
        let b = storage.create_conversation(Some("B")).await.expect("b");
        let c = storage.create_conversation(Some("C")).await.expect("c");

        let recent = storage.get_recent_conversations(Some(2)).await.expect("recent");
        let ids: Vec<_> = recent.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![c, b]);

        storage
            .save_message(a, MessageRole::User, "bump")
            .await
            .expect("bump a");
        let recent = storage.get_recent_conversations(None).await.expect("recent");
        let ids: Vec<_> = recent.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, c, b]);
    }

    #[tokio::test]
    async fn renames_conversation() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let id = storage.create_conversation(None).await.expect("conversation");
        storage
            .update_conversation_title(id, "Tokio notes")
            .await
            .expect("rename");
        let conversation = storage.get_conversation(id).await.expect("lookup");
        assert_eq!(conversation.map(|c| c.title).as_deref(), Some("Tokio notes"));
    }

    #[tokio::test]
    async fn delete_removes_conversation_and_messages() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let doomed = storage.create_conversation(Some("doomed")).await.expect("doomed");
        let kept = storage.create_conversation(Some("kept")).await.expect("kept");
        for text in ["sqlite transactions", "cascade semantics"] {
            storage
                .save_message(doomed, MessageRole::User, text)
                .await
                .expect("save");
        }
        storage
            .save_message(kept, MessageRole::User, "sqlite pragmas")
            .await
            .expect("save kept");

        storage.delete_conversation(doomed).await.expect("delete");

        assert!(storage.get_conversation(doomed).await.expect("lookup").is_none());
        assert_eq!(storage.message_count(doomed).await.expect("count"), 0);
        let hits = storage
            .find_messages_by_keywords(&["sqlite".to_string(), "cascade".to_string()])
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_id, kept);
    }

    #[tokio::test]
    async fn failed_delete_rolls_back_every_table() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let id = storage.create_conversation(Some("pinned")).await.expect("conversation");
        storage
            .save_message(id, MessageRole::User, "rollback semantics")
            .await
            .expect("save");

        // Fails the last statement, after messages and keywords are already gone.
        sqlx::query(
            "CREATE TRIGGER block_delete BEFORE DELETE ON conversations \
             BEGIN SELECT RAISE(ABORT, 'blocked'); END",
        )
        .execute(&storage.pool)
        .await
        .expect("trigger");

        storage
            .delete_conversation(id)
            .await
            .expect_err("delete is blocked");

        assert!(storage.get_conversation(id).await.expect("lookup").is_some());
        assert_eq!(storage.message_count(id).await.expect("count"), 1);
        let hits = storage
            .find_messages_by_keywords(&["rollback".to_string()])
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_id, id);
    }

    #[tokio::test]
    async fn keyword_lookup_is_distinct_any_of() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let id = storage.create_conversation(None).await.expect("conversation");
        storage
            .save_message(id, MessageRole::User, "rust ownership and rust borrowing")
            .await
            .expect("save");
        storage
            .save_message(id, MessageRole::Assistant, "python decorators")
            .await
            .expect("save");

        let hits = storage
            .find_messages_by_keywords(&["rust".to_string(), "borrowing".to_string()])
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "rust ownership and rust borrowing");

        assert!(storage.find_messages_by_keywords(&[]).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.db");
        {
            let storage = SqliteStorage::connect(&path).await.expect("open");
            let id = storage.create_conversation(Some("kept")).await.expect("create");
            storage
                .save_message(id, MessageRole::User, "durable message")
                .await
                .expect("save");
        }

        let storage = SqliteStorage::connect(&path).await.expect("reopen");
        let recent = storage.get_recent_conversations(None).await.expect("recent");
        assert_eq!(recent.len(), 1);
        let history = storage
            .get_conversation_history(recent[0].id)
            .await
            .expect("history");
        assert_eq!(history[0].content, "durable message");
    }
}
