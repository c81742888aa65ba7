//! Typed inbound events and the handler table the transport dispatches into.

use super::{PresenceProtocol, ProtocolError, Result};
use crate::broadcast::BroadcastBus;
use crate::models::{ChatMessage, ConnectionId, ErrorFrame, Frame};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Something a client connection did.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Connect {
        connection_id: ConnectionId,
        identity: Option<String>,
    },
    Join {
        connection_id: ConnectionId,
        message: ChatMessage,
    },
    Send {
        connection_id: ConnectionId,
        message: ChatMessage,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Join,
    Send,
    Disconnect,
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Connect { .. } => EventKind::Connect,
            InboundEvent::Join { .. } => EventKind::Join,
            InboundEvent::Send { .. } => EventKind::Send,
            InboundEvent::Disconnect { .. } => EventKind::Disconnect,
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            InboundEvent::Connect { connection_id, .. }
            | InboundEvent::Join { connection_id, .. }
            | InboundEvent::Send { connection_id, .. }
            | InboundEvent::Disconnect { connection_id } => connection_id,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: InboundEvent) -> Result<()>;
}

struct ConnectHandler(Arc<PresenceProtocol>);
struct JoinHandler(Arc<PresenceProtocol>);
struct SendHandler(Arc<PresenceProtocol>);
struct DisconnectHandler(Arc<PresenceProtocol>);

#[async_trait]
impl EventHandler for ConnectHandler {
    async fn handle(&self, event: InboundEvent) -> Result<()> {
        if let InboundEvent::Connect {
            connection_id,
            identity,
        } = event
        {
            self.0.on_connect(&connection_id, identity);
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for JoinHandler {
    async fn handle(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Join {
                connection_id,
                message,
            } => self.0.on_join(&connection_id, message).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EventHandler for SendHandler {
    async fn handle(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Send {
                connection_id,
                message,
            } => self.0.on_send(&connection_id, message).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EventHandler for DisconnectHandler {
    async fn handle(&self, event: InboundEvent) -> Result<()> {
        if let InboundEvent::Disconnect { connection_id } = event {
            self.0.on_disconnect(&connection_id);
        }
        Ok(())
    }
}

/// Routes each inbound event to the handler registered for its kind.
///
/// Failures are reported back to the originating connection as an `ERROR`
/// frame and returned to the caller.
pub struct Dispatcher {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
    bus: Arc<BroadcastBus>,
}

impl Dispatcher {
    pub fn new(bus: Arc<BroadcastBus>) -> Self {
        Self {
            handlers: HashMap::new(),
            bus,
        }
    }

    /// Dispatcher wired to the presence protocol for every event kind.
    pub fn for_protocol(protocol: Arc<PresenceProtocol>) -> Self {
        let mut dispatcher = Self::new(Arc::clone(protocol.bus()));
        dispatcher.register(EventKind::Connect, ConnectHandler(Arc::clone(&protocol)));
        dispatcher.register(EventKind::Join, JoinHandler(Arc::clone(&protocol)));
        dispatcher.register(EventKind::Send, SendHandler(Arc::clone(&protocol)));
        dispatcher.register(EventKind::Disconnect, DisconnectHandler(protocol));
        dispatcher
    }

    pub fn register(&mut self, kind: EventKind, handler: impl EventHandler + 'static) {
        let _ = self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn dispatch(&self, event: InboundEvent) -> Result<()> {
        let kind = event.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            debug!(?kind, "no handler registered, ignoring event");
            return Ok(());
        };

        let connection_id = event.connection_id().to_string();
        match handler.handle(event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reject(&connection_id, &e);
                Err(e)
            }
        }
    }

    fn reject(&self, connection_id: &str, err: &ProtocolError) {
        let message = if err.is_violation() {
            info!(connection_id, error = %err, "rejected client event");
            err.to_string()
        } else {
            error!(connection_id, error = %err, "failed to handle client event");
            "internal error".to_string()
        };
        self.bus
            .send_to_connection(connection_id, &Frame::from(ErrorFrame::new(message)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::PUBLIC_TOPIC;
    use crate::clock::MonotonicClock;
    use crate::presence::PresenceRegistry;
    use crate::sessions::SessionManager;
    use crate::store::{ChatStore, SqliteChatStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn protocol() -> Arc<PresenceProtocol> {
        let store: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::in_memory().await.unwrap());
        let clock = Arc::new(MonotonicClock::new());
        Arc::new(PresenceProtocol::new(
            Arc::new(PresenceRegistry::new()),
            Arc::new(SessionManager::new(Arc::clone(&store), Arc::clone(&clock))),
            Arc::new(BroadcastBus::new(16)),
            store,
            clock,
        ))
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: InboundEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_ignored() {
        let bus = Arc::new(BroadcastBus::new(4));
        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new(bus);
        dispatcher.register(EventKind::Connect, Counting(Arc::clone(&hits)));

        dispatcher
            .dispatch(InboundEvent::Disconnect {
                connection_id: "c1".into(),
            })
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        dispatcher
            .dispatch(InboundEvent::Connect {
                connection_id: "c1".into(),
                identity: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_violation_is_reported_to_sender() {
        let protocol = protocol().await;
        let mut rx = protocol.bus().register("c1");
        protocol.bus().subscribe("c1", PUBLIC_TOPIC);
        let dispatcher = Dispatcher::for_protocol(Arc::clone(&protocol));

        dispatcher
            .dispatch(InboundEvent::Connect {
                connection_id: "c1".into(),
                identity: None,
            })
            .await
            .unwrap();
        let err = dispatcher
            .dispatch(InboundEvent::Send {
                connection_id: "c1".into(),
                message: ChatMessage::chat("Neha", "hi"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotJoined(_)));

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "ERROR");
        assert_eq!(frame["message"], "join before sending messages");
    }

    #[tokio::test]
    async fn test_for_protocol_covers_every_kind() {
        let dispatcher = Dispatcher::for_protocol(protocol().await);
        for kind in [
            EventKind::Connect,
            EventKind::Join,
            EventKind::Send,
            EventKind::Disconnect,
        ] {
            assert!(dispatcher.has_handler(kind));
        }
    }
}
