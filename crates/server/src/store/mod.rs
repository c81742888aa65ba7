//! Persistence boundary for users, chat sessions and messages.
//!
//! The core calls the store once per event and never caches its answers;
//! relationships (session ⇄ participants ⇄ users) are resolved through these
//! queries rather than through object references.

pub mod sqlite;

use crate::models::{ChatMessage, ChatSession, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

pub use sqlite::SqliteChatStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message and return its row id.
    async fn save_message(&self, message: &ChatMessage) -> Result<i64>;

    /// Insert or update a session row together with its participants.
    async fn save_session(&self, session: &ChatSession) -> Result<()>;

    async fn add_participant(&self, session_id: &str, username: &str) -> Result<()>;

    async fn participants(&self, session_id: &str) -> Result<BTreeSet<String>>;

    /// Stamp `ended_at` on an open session. Returns `false` when the session
    /// was already ended or does not exist.
    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<bool>;

    async fn find_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    /// Most recently created session with no `ended_at`.
    async fn find_active_session(&self) -> Result<Option<ChatSession>>;

    async fn save_user(&self, user: &User) -> Result<()>;

    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Every message, oldest first.
    async fn find_all_order_by_timestamp_asc(&self) -> Result<Vec<ChatMessage>>;

    /// Messages at or after `since` from sessions `username` took part in, newest first.
    async fn find_messages_since_for_user(
        &self,
        since: DateTime<Utc>,
        username: &str,
    ) -> Result<Vec<ChatMessage>>;
}
