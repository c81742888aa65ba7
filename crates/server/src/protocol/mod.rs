//! Presence protocol: the per-connection state machine that sequences
//! roster replay, JOIN/LEAVE announcements and message fan-out.
//!
//! ```text
//! CONNECTED --join--> JOINED --disconnect--> CLOSED
//!     └──────────────disconnect──────────────┘
//! ```
//!
//! A joining connection is sent one point-to-point JOIN per user already
//! present before its own JOIN and the new roster are broadcast. All three go
//! through the same per-connection queue, so the newcomer always has the
//! existing roster before it sees itself announced.

pub mod dispatch;

use crate::broadcast::{BroadcastBus, PUBLIC_TOPIC};
use crate::clock::MonotonicClock;
use crate::models::{ChatMessage, ConnectionId, Frame, MessageType, UserList};
use crate::presence::PresenceRegistry;
use crate::sessions::{SessionError, SessionManager};
use crate::store::{ChatStore, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use dispatch::{Dispatcher, EventHandler, EventKind, InboundEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Joined,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection {0} is not open")]
    NotConnected(ConnectionId),
    #[error("join before sending messages")]
    NotJoined(ConnectionId),
    #[error("connection already joined as {username}")]
    AlreadyJoined {
        connection_id: ConnectionId,
        username: String,
    },
    #[error("join requires a sender")]
    MissingSender,
    #[error("signed in as {expected}, not {actual}")]
    IdentityMismatch { expected: String, actual: String },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProtocolError {
    /// Whether the client broke protocol, as opposed to an internal failure.
    pub fn is_violation(&self) -> bool {
        !matches!(self, ProtocolError::Session(_) | ProtocolError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone)]
struct Connection {
    state: ConnectionState,
    /// Username proven at connect time, when sign-in is required
    identity: Option<String>,
}

pub struct PresenceProtocol {
    registry: Arc<PresenceRegistry>,
    sessions: Arc<SessionManager>,
    bus: Arc<BroadcastBus>,
    store: Arc<dyn ChatStore>,
    clock: Arc<MonotonicClock>,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl PresenceProtocol {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        sessions: Arc<SessionManager>,
        bus: Arc<BroadcastBus>,
        store: Arc<dyn ChatStore>,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        Self {
            registry,
            sessions,
            bus,
            store,
            clock,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<BroadcastBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// State of `connection_id`. Untracked connections report `Closed`.
    pub fn connection_state(&self, connection_id: &str) -> ConnectionState {
        self.connections
            .read()
            .get(connection_id)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Transport established; `identity` is the signed-in username, if any.
    pub fn on_connect(&self, connection_id: &str, identity: Option<String>) {
        info!(connection_id, identity = ?identity, "connection opened");
        self.connections.write().insert(
            connection_id.to_string(),
            Connection {
                state: ConnectionState::Connected,
                identity,
            },
        );
    }

    pub async fn on_join(&self, connection_id: &str, message: ChatMessage) -> Result<()> {
        let identity = self.require_state(connection_id, ConnectionState::Connected)?;

        let username = message.sender.trim().to_string();
        if username.is_empty() {
            return Err(ProtocolError::MissingSender);
        }
        check_identity(identity.as_deref(), &username)?;

        // Snapshot before registering: these are the users that already exist.
        let existing = self.registry.active_users();
        for existing_user in &existing {
            self.bus
                .send_to_connection(connection_id, &Frame::from(ChatMessage::join(existing_user)));
        }
        if !existing.is_empty() {
            debug!(
                connection_id,
                count = existing.len(),
                "replayed existing users to newcomer"
            );
        }

        self.registry.add(connection_id, &username);

        let joined = match self.record_join(&username, message).await {
            Ok(joined) => joined,
            Err(e) => {
                self.registry.remove(connection_id);
                return Err(e);
            }
        };

        self.bus.publish(PUBLIC_TOPIC, &Frame::from(joined));
        self.publish_roster();

        self.set_state(connection_id, ConnectionState::Joined);
        info!(connection_id, username = %username, "user joined");
        Ok(())
    }

    /// Participant bookkeeping and persistence for an inbound JOIN.
    async fn record_join(&self, username: &str, message: ChatMessage) -> Result<ChatMessage> {
        let known = self.store.find_by_username(username).await?.is_some();
        if !known {
            debug!(username, "no account for joining user; not added to session");
        }

        let mut joined = message;
        joined.message_type = MessageType::Join;
        joined.sender = username.to_string();
        if joined.content.is_empty() {
            joined.content = format!("{} joined!", username);
        }
        Ok(self
            .sessions
            .record(joined, known.then_some(username))
            .await?)
    }

    pub async fn on_send(&self, connection_id: &str, message: ChatMessage) -> Result<()> {
        let identity = self.require_state(connection_id, ConnectionState::Joined)?;
        check_identity(identity.as_deref(), &message.sender)?;

        let message = self.sessions.record(message, None).await?;

        if let Some(file_name) = &message.file.file_name {
            debug!(sender = %message.sender, file_name, "message carries attachment");
        }
        self.bus.publish(PUBLIC_TOPIC, &Frame::from(message));
        Ok(())
    }

    /// Tear down `connection_id`. Connections that never joined leave silently.
    pub fn on_disconnect(&self, connection_id: &str) {
        self.connections.write().remove(connection_id);

        let Some(username) = self.registry.remove(connection_id) else {
            debug!(connection_id, "disconnect without presence");
            return;
        };

        info!(connection_id, username = %username, "user left");
        let mut leave = ChatMessage::leave(&username);
        leave.timestamp = Some(self.clock.now());
        self.bus.publish(PUBLIC_TOPIC, &Frame::from(leave));
        self.publish_roster();
    }

    fn publish_roster(&self) {
        let users = self.registry.active_users();
        debug!(users = ?users, "broadcasting user list");
        self.bus
            .publish(PUBLIC_TOPIC, &Frame::from(UserList::new(users)));
    }

    /// Check the connection is in `expected` and return its identity.
    fn require_state(
        &self,
        connection_id: &str,
        expected: ConnectionState,
    ) -> Result<Option<String>> {
        let connections = self.connections.read();
        let Some(connection) = connections.get(connection_id) else {
            return Err(ProtocolError::NotConnected(connection_id.to_string()));
        };

        match (connection.state, expected) {
            (actual, expected) if actual == expected => Ok(connection.identity.clone()),
            (ConnectionState::Joined, ConnectionState::Connected) => {
                Err(ProtocolError::AlreadyJoined {
                    connection_id: connection_id.to_string(),
                    username: self
                        .registry
                        .username_of(connection_id)
                        .unwrap_or_default(),
                })
            }
            (ConnectionState::Connected, ConnectionState::Joined) => {
                Err(ProtocolError::NotJoined(connection_id.to_string()))
            }
            _ => Err(ProtocolError::NotConnected(connection_id.to_string())),
        }
    }

    fn set_state(&self, connection_id: &str, state: ConnectionState) {
        match self.connections.write().get_mut(connection_id) {
            Some(connection) => connection.state = state,
            None => warn!(connection_id, "state change for untracked connection"),
        }
    }
}

fn check_identity(identity: Option<&str>, sender: &str) -> Result<()> {
    match identity {
        Some(expected) if expected != sender => Err(ProtocolError::IdentityMismatch {
            expected: expected.to_string(),
            actual: sender.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Payload;
    use crate::models::{ChatSession, User};
    use crate::store::SqliteChatStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::OnceLock;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Harness {
        protocol: PresenceProtocol,
        store: Arc<dyn ChatStore>,
        sessions: Arc<SessionManager>,
    }

    async fn harness() -> Harness {
        let store: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::in_memory().await.unwrap());
        for name in ["Saurabh", "Neha"] {
            store
                .save_user(&User {
                    username: name.into(),
                    password_hash: "x".into(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let clock = Arc::new(MonotonicClock::new());
        let sessions = Arc::new(SessionManager::new(Arc::clone(&store), Arc::clone(&clock)));
        let protocol = PresenceProtocol::new(
            Arc::new(PresenceRegistry::new()),
            Arc::clone(&sessions),
            Arc::new(BroadcastBus::new(64)),
            Arc::clone(&store),
            clock,
        );
        Harness {
            protocol,
            store,
            sessions,
        }
    }

    fn connect(protocol: &PresenceProtocol, id: &str) -> mpsc::Receiver<Payload> {
        let rx = protocol.bus().register(id);
        protocol.bus().subscribe(id, PUBLIC_TOPIC);
        protocol.on_connect(id, None);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            frames.push(serde_json::from_str(&payload).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_send_before_join_is_rejected() {
        let h = harness().await;
        let mut rx = connect(&h.protocol, "c1");

        let err = h
            .protocol
            .on_send("c1", ChatMessage::chat("Neha", "too early"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotJoined(_)));
        assert!(err.is_violation());
        assert!(drain(&mut rx).is_empty());
        assert!(h.store.find_all_order_by_timestamp_asc().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_twice_on_one_connection_is_rejected() {
        let h = harness().await;
        let _rx = connect(&h.protocol, "c1");

        h.protocol.on_join("c1", ChatMessage::join("Neha")).await.unwrap();
        let err = h
            .protocol
            .on_join("c1", ChatMessage::join("Neha"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyJoined { .. }));
    }

    #[tokio::test]
    async fn test_join_without_sender_is_rejected() {
        let h = harness().await;
        let _rx = connect(&h.protocol, "c1");

        let err = h
            .protocol
            .on_join("c1", ChatMessage::new(MessageType::Join, "  ", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingSender));
        assert_eq!(h.protocol.connection_state("c1"), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_join_of_unknown_account_skips_participation() {
        let h = harness().await;
        let mut rx = connect(&h.protocol, "c1");

        h.protocol.on_join("c1", ChatMessage::join("Ghost")).await.unwrap();

        let session = h.sessions.current_session().await.unwrap();
        assert!(session.participants.is_empty());
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "JOIN");
        assert_eq!(frames[0]["sender"], "Ghost");
        assert_eq!(frames[1]["users"], serde_json::json!(["Ghost"]));
    }

    #[tokio::test]
    async fn test_identity_mismatch_is_rejected() {
        let h = harness().await;
        let _rx = h.protocol.bus().register("c1");
        h.protocol.on_connect("c1", Some("Neha".into()));

        let err = h
            .protocol
            .on_join("c1", ChatMessage::join("Saurabh"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::IdentityMismatch { .. }));
        assert!(h.protocol.registry().active_users().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_without_join_is_silent() {
        let h = harness().await;
        let mut rx_other = connect(&h.protocol, "other");
        let _rx = connect(&h.protocol, "c1");

        h.protocol.on_disconnect("c1");
        h.protocol.on_disconnect("never-seen");

        assert!(drain(&mut rx_other).is_empty());
        assert_eq!(h.protocol.connection_state("c1"), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_events_after_close_are_rejected() {
        let h = harness().await;
        let _rx = connect(&h.protocol, "c1");
        h.protocol.on_join("c1", ChatMessage::join("Neha")).await.unwrap();
        h.protocol.on_disconnect("c1");

        let err = h
            .protocol
            .on_send("c1", ChatMessage::chat("Neha", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_send_persists_and_attaches_to_current_session() {
        let h = harness().await;
        let mut rx = connect(&h.protocol, "c1");
        h.protocol.on_join("c1", ChatMessage::join("Neha")).await.unwrap();
        drain(&mut rx);

        h.protocol
            .on_send("c1", ChatMessage::chat("Neha", "hello"))
            .await
            .unwrap();

        let session = h.sessions.current_session().await.unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["content"], "hello");
        assert_eq!(frames[0]["sessionId"], session.id.as_str());

        let stored = h.store.find_all_order_by_timestamp_asc().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "hello");
        assert!(stored[0].timestamp <= stored[1].timestamp);
    }

    /// Store that ends the open session from inside selected calls, the
    /// way a concurrent `POST /api/sessions/end` would.
    struct EndingStore {
        inner: SqliteChatStore,
        sessions: OnceLock<Arc<SessionManager>>,
        end_on_lookup: AtomicBool,
        end_on_save: AtomicBool,
        end_finished_during_save: AtomicBool,
        pending_end: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    }

    impl EndingStore {
        fn sessions(&self) -> Arc<SessionManager> {
            Arc::clone(self.sessions.get().unwrap())
        }
    }

    #[async_trait]
    impl ChatStore for EndingStore {
        async fn save_message(&self, message: &ChatMessage) -> crate::store::Result<i64> {
            if self.end_on_save.swap(false, AtomicOrdering::SeqCst) {
                let sessions = self.sessions();
                let end = tokio::spawn(async move {
                    sessions.end_current().await.unwrap();
                });
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                self.end_finished_during_save
                    .store(end.is_finished(), AtomicOrdering::SeqCst);
                *self.pending_end.lock() = Some(end);
            }
            self.inner.save_message(message).await
        }

        async fn save_session(&self, session: &ChatSession) -> crate::store::Result<()> {
            self.inner.save_session(session).await
        }

        async fn add_participant(&self, session_id: &str, username: &str) -> crate::store::Result<()> {
            self.inner.add_participant(session_id, username).await
        }

        async fn participants(&self, session_id: &str) -> crate::store::Result<BTreeSet<String>> {
            self.inner.participants(session_id).await
        }

        async fn end_session(
            &self,
            session_id: &str,
            ended_at: DateTime<Utc>,
        ) -> crate::store::Result<bool> {
            self.inner.end_session(session_id, ended_at).await
        }

        async fn find_session(&self, session_id: &str) -> crate::store::Result<Option<ChatSession>> {
            self.inner.find_session(session_id).await
        }

        async fn find_active_session(&self) -> crate::store::Result<Option<ChatSession>> {
            self.inner.find_active_session().await
        }

        async fn save_user(&self, user: &User) -> crate::store::Result<()> {
            self.inner.save_user(user).await
        }

        async fn find_by_username(&self, username: &str) -> crate::store::Result<Option<User>> {
            if self.end_on_lookup.swap(false, AtomicOrdering::SeqCst) {
                self.sessions().end_current().await.unwrap();
            }
            self.inner.find_by_username(username).await
        }

        async fn find_all_order_by_timestamp_asc(&self) -> crate::store::Result<Vec<ChatMessage>> {
            self.inner.find_all_order_by_timestamp_asc().await
        }

        async fn find_messages_since_for_user(
            &self,
            since: DateTime<Utc>,
            username: &str,
        ) -> crate::store::Result<Vec<ChatMessage>> {
            self.inner.find_messages_since_for_user(since, username).await
        }
    }

    async fn ending_harness() -> (PresenceProtocol, Arc<EndingStore>, Arc<SessionManager>) {
        let inner = SqliteChatStore::in_memory().await.unwrap();
        inner
            .save_user(&User {
                username: "Neha".into(),
                password_hash: "x".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let ending = Arc::new(EndingStore {
            inner,
            sessions: OnceLock::new(),
            end_on_lookup: AtomicBool::new(false),
            end_on_save: AtomicBool::new(false),
            end_finished_during_save: AtomicBool::new(false),
            pending_end: parking_lot::Mutex::new(None),
        });
        let store: Arc<dyn ChatStore> = ending.clone();
        let clock = Arc::new(MonotonicClock::new());
        let sessions = Arc::new(SessionManager::new(Arc::clone(&store), Arc::clone(&clock)));
        let _ = ending.sessions.set(Arc::clone(&sessions));

        let protocol = PresenceProtocol::new(
            Arc::new(PresenceRegistry::new()),
            Arc::clone(&sessions),
            Arc::new(BroadcastBus::new(64)),
            store,
            clock,
        );
        (protocol, ending, sessions)
    }

    #[tokio::test]
    async fn test_join_survives_session_end_during_account_lookup() {
        let (protocol, store, sessions) = ending_harness().await;
        let before = sessions.current_session().await.unwrap();
        let mut rx = connect(&protocol, "c1");

        store.end_on_lookup.store(true, AtomicOrdering::SeqCst);
        protocol.on_join("c1", ChatMessage::join("Neha")).await.unwrap();

        let ended = store.find_session(&before.id).await.unwrap().unwrap();
        assert!(ended.ended_at.is_some());

        let after = sessions.current_session().await.unwrap();
        assert_ne!(after.id, before.id);
        assert!(after.participants.contains("Neha"));

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "JOIN");
        assert_eq!(frames[0]["sessionId"], after.id.as_str());
        assert_eq!(frames[1]["users"], serde_json::json!(["Neha"]));
        assert_eq!(protocol.connection_state("c1"), ConnectionState::Joined);
    }

    #[tokio::test]
    async fn test_session_end_waits_for_in_flight_save() {
        let (protocol, store, _sessions) = ending_harness().await;
        let _rx = connect(&protocol, "c1");
        protocol.on_join("c1", ChatMessage::join("Neha")).await.unwrap();

        store.end_on_save.store(true, AtomicOrdering::SeqCst);
        protocol
            .on_send("c1", ChatMessage::chat("Neha", "last words"))
            .await
            .unwrap();
        assert!(!store.end_finished_during_save.load(AtomicOrdering::SeqCst));

        let end = store.pending_end.lock().take().unwrap();
        end.await.unwrap();

        let stored = store.find_all_order_by_timestamp_asc().await.unwrap();
        let chat = stored.iter().find(|m| m.content == "last words").unwrap();
        let session = store
            .find_session(chat.session_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        let ended_at = session.ended_at.unwrap();
        assert!(ended_at >= chat.timestamp.unwrap());
    }
}
