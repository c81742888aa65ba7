//! Chat sessions: non-overlapping slices of the message timeline.
//!
//! At most one session is open at a time. It is created lazily by the first
//! caller that finds none open and stays open until an explicit end.

use crate::clock::MonotonicClock;
use crate::models::{ChatMessage, ChatSession};
use crate::store::{ChatStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("chat session {0} has ended")]
    Ended(String),
    #[error("unknown chat session {0}")]
    Unknown(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

pub struct SessionManager {
    store: Arc<dyn ChatStore>,
    clock: Arc<MonotonicClock>,
    /// The open session, if any. Held across the create-if-absent check.
    current: Mutex<Option<ChatSession>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ChatStore>, clock: Arc<MonotonicClock>) -> Self {
        Self {
            store,
            clock,
            current: Mutex::new(None),
        }
    }

    /// Return the open session, creating one if none is open.
    ///
    /// After a restart the newest unended session in the store is adopted
    /// instead of opening a second one.
    pub async fn current_session(&self) -> Result<ChatSession> {
        let mut current = self.current.lock().await;
        Ok(self.ensure_open(&mut current).await?.clone())
    }

    /// Stamp, attach and persist `message` in the open session, adding
    /// `participant` first when given.
    ///
    /// Runs under the session lock, so an end cannot slip in between
    /// resolving the session and saving into it.
    pub async fn record(
        &self,
        message: ChatMessage,
        participant: Option<&str>,
    ) -> Result<ChatMessage> {
        let mut current = self.current.lock().await;
        let session = self.ensure_open(&mut current).await?;

        if let Some(username) = participant {
            if session.participants.insert(username.to_string()) {
                self.store.add_participant(&session.id, username).await?;
                debug!(session_id = %session.id, username, "participant added");
            }
        }

        let mut message = message.received_at(self.clock.now());
        self.attach(session, &mut message);
        message.id = Some(self.store.save_message(&message).await?);
        Ok(message)
    }

    async fn ensure_open<'a>(
        &self,
        current: &'a mut Option<ChatSession>,
    ) -> Result<&'a mut ChatSession> {
        let session = match current.take() {
            Some(open) => open,
            None => match self.store.find_active_session().await? {
                Some(session) => {
                    debug!(session_id = %session.id, "adopted open chat session from store");
                    session
                }
                None => {
                    let session = ChatSession::open(self.clock.now());
                    self.store.save_session(&session).await?;
                    info!(session_id = %session.id, "opened chat session");
                    session
                }
            },
        };
        Ok(current.insert(session))
    }

    /// Point `message` at `session`. A message already attached keeps its session.
    pub fn attach(&self, session: &ChatSession, message: &mut ChatMessage) {
        if message.session_id.is_none() {
            message.session_id = Some(session.id.clone());
        }
    }

    /// Add `username` to the participants of an open session. Repeats are no-ops.
    pub async fn add_participant(&self, session: &ChatSession, username: &str) -> Result<()> {
        let mut current = self.current.lock().await;

        if let Some(open) = current.as_mut().filter(|open| open.id == session.id) {
            if open.participants.insert(username.to_string()) {
                self.store.add_participant(&open.id, username).await?;
                debug!(session_id = %open.id, username, "participant added");
            }
            return Ok(());
        }

        match self.store.find_session(&session.id).await? {
            Some(stored) if stored.is_open() => {
                self.store.add_participant(&stored.id, username).await?;
                Ok(())
            }
            Some(stored) => Err(SessionError::Ended(stored.id)),
            None => Err(SessionError::Unknown(session.id.clone())),
        }
    }

    /// Stamp `ended_at` on `session`. Ending an ended session is a no-op.
    ///
    /// Returns whether this call ended it.
    pub async fn end_session(&self, session: &ChatSession) -> Result<bool> {
        let mut current = self.current.lock().await;
        let ended = self.store.end_session(&session.id, self.clock.now()).await?;

        if current.as_ref().is_some_and(|open| open.id == session.id) {
            *current = None;
        }

        if ended {
            info!(session_id = %session.id, "ended chat session");
        }
        Ok(ended)
    }

    /// End whatever session is open, returning it in its ended form.
    pub async fn end_current(&self) -> Result<Option<ChatSession>> {
        let open = {
            let current = self.current.lock().await;
            match current.as_ref() {
                Some(session) => Some(session.clone()),
                None => self.store.find_active_session().await?,
            }
        };

        let Some(session) = open else {
            return Ok(None);
        };
        self.end_session(&session).await?;
        Ok(self.store.find_session(&session.id).await?)
    }

    /// Messages at or after `since` from sessions `username` took part in, newest first.
    pub async fn history_for_user(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>> {
        Ok(self
            .store
            .find_messages_since_for_user(since, username)
            .await?)
    }
}
