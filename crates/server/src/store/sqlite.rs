//! SQLite-backed [`ChatStore`].

use super::{ChatStore, Result, StoreError};
use crate::models::{ChatMessage, ChatSession, FileAttachment, MessageType, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

type MessageRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    Option<String>,
);

const MESSAGE_COLUMNS: &str = "id, type, sender, content, file_name, file_type, file_url, file_id, timestamp, session_id";

pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let store = Self { pool };
        store.init_db().await?;

        info!("[Store] Initialized at {:?}", path);
        Ok(store)
    }

    /// Private in-memory database; a single pooled connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                ended_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_participants (
                session_id TEXT NOT NULL,
                username TEXT NOT NULL,
                PRIMARY KEY (session_id, username),
                FOREIGN KEY (session_id) REFERENCES chat_sessions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                file_name TEXT,
                file_type TEXT,
                file_url TEXT,
                file_id TEXT,
                timestamp INTEGER NOT NULL,
                session_id TEXT,
                FOREIGN KEY (session_id) REFERENCES chat_sessions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON chat_messages(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn session_from_row(
        &self,
        (id, created_at, ended_at): (String, i64, Option<i64>),
    ) -> Result<ChatSession> {
        let participants = self.participants(&id).await?;
        Ok(ChatSession {
            created_at: from_micros(created_at)?,
            ended_at: ended_at.map(from_micros).transpose()?,
            participants,
            id,
        })
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", micros)))
}

fn message_from_row(row: MessageRow) -> Result<ChatMessage> {
    let (id, kind, sender, content, file_name, file_type, file_url, file_id, timestamp, session_id) =
        row;
    let message_type = MessageType::parse(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown message type {:?}", kind)))?;

    Ok(ChatMessage {
        id: Some(id),
        message_type,
        sender,
        content,
        file: FileAttachment {
            file_name,
            file_type,
            file_url,
            file_id,
        },
        timestamp: Some(from_micros(timestamp)?),
        session_id,
    })
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn save_message(&self, message: &ChatMessage) -> Result<i64> {
        let timestamp = message.timestamp.unwrap_or_else(Utc::now);
        let result = sqlx::query(
            "INSERT INTO chat_messages (type, sender, content, file_name, file_type, file_url, file_id, timestamp, session_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.message_type.as_str())
        .bind(&message.sender)
        .bind(&message.content)
        .bind(&message.file.file_name)
        .bind(&message.file.file_type)
        .bind(&message.file.file_url)
        .bind(&message.file.file_id)
        .bind(to_micros(timestamp))
        .bind(&message.session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn save_session(&self, session: &ChatSession) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chat_sessions (id, created_at, ended_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET ended_at = excluded.ended_at",
        )
        .bind(&session.id)
        .bind(to_micros(session.created_at))
        .bind(session.ended_at.map(to_micros))
        .execute(&mut *tx)
        .await?;

        for username in &session.participants {
            sqlx::query(
                "INSERT OR IGNORE INTO session_participants (session_id, username) VALUES (?, ?)",
            )
            .bind(&session.id)
            .bind(username)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn add_participant(&self, session_id: &str, username: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO session_participants (session_id, username) VALUES (?, ?)",
        )
        .bind(session_id)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn participants(&self, session_id: &str) -> Result<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT username FROM session_participants WHERE session_id = ? ORDER BY username",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(username,)| username).collect())
    }

    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("UPDATE chat_sessions SET ended_at = ? WHERE id = ? AND ended_at IS NULL")
                .bind(to_micros(ended_at))
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let row: Option<(String, i64, Option<i64>)> =
            sqlx::query_as("SELECT id, created_at, ended_at FROM chat_sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(Some(self.session_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_active_session(&self) -> Result<Option<ChatSession>> {
        let row: Option<(String, i64, Option<i64>)> = sqlx::query_as(
            "SELECT id, created_at, ended_at FROM chat_sessions
             WHERE ended_at IS NULL ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.session_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET password_hash = excluded.password_hash",
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(to_micros(user.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT username, password_hash, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((username, password_hash, created_at)) => Ok(Some(User {
                username,
                password_hash,
                created_at: from_micros(created_at)?,
            })),
            None => Ok(None),
        }
    }

    async fn find_all_order_by_timestamp_asc(&self) -> Result<Vec<ChatMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_messages ORDER BY timestamp ASC, id ASC",
            MESSAGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn find_messages_since_for_user(
        &self,
        since: DateTime<Utc>,
        username: &str,
    ) -> Result<Vec<ChatMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_messages
             WHERE timestamp >= ?
               AND session_id IN (
                   SELECT session_id FROM session_participants WHERE username = ?
               )
             ORDER BY timestamp DESC, id DESC",
            MESSAGE_COLUMNS
        ))
        .bind(to_micros(since))
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}
