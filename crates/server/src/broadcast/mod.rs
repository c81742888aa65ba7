//! Fan-out of frames to connected clients.
//!
//! Every connection owns a bounded outbound queue drained by its own writer
//! task. Publishing only ever `try_send`s into those queues, so a slow or
//! dead subscriber costs a dropped frame, never a stalled publisher.
//! Delivery is best-effort and at-most-once; frames from one publisher reach
//! each subscriber in the order they were published.

use crate::models::{ConnectionId, Frame};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Topic every chat client listens on.
pub const PUBLIC_TOPIC: &str = "public";

/// Serialized frame as handed to writer tasks.
pub type Payload = Arc<String>;

/// One connection's outbound side.
pub struct Subscriber {
    pub id: ConnectionId,
    tx: mpsc::Sender<Payload>,
    topics: Mutex<HashSet<String>>,
    /// Frames dropped because the queue was full or closed.
    dropped: AtomicU64,
}

impl Subscriber {
    fn new(id: ConnectionId, tx: mpsc::Sender<Payload>) -> Self {
        Self {
            id,
            tx,
            topics: Mutex::new(HashSet::new()),
            dropped: AtomicU64::new(0),
        }
    }

    fn listens_to(&self, topic: &str) -> bool {
        self.topics.lock().contains(topic)
    }

    /// Queue `payload` without waiting. Returns `false` if it was dropped.
    fn offer(&self, payload: Payload) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(payload)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection_id = %self.id,
                    len = payload.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(connection_id = %self.id, "subscriber gone, dropping frame");
                false
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct BroadcastBus {
    subscribers: RwLock<HashMap<ConnectionId, Arc<Subscriber>>>,
    queue_capacity: usize,
}

impl BroadcastBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection and return the receiving end of its queue.
    pub fn register(&self, connection_id: &str) -> mpsc::Receiver<Payload> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let subscriber = Arc::new(Subscriber::new(connection_id.to_string(), tx));
        self.subscribers
            .write()
            .insert(connection_id.to_string(), subscriber);
        rx
    }

    /// Subscribe a registered connection to `topic`. Unknown connections are ignored.
    pub fn subscribe(&self, connection_id: &str, topic: &str) {
        if let Some(subscriber) = self.subscribers.read().get(connection_id) {
            subscriber.topics.lock().insert(topic.to_string());
        }
    }

    /// Stop all future deliveries to `connection_id`.
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Subscriber>> {
        self.subscribers.write().remove(connection_id)
    }

    /// Deliver `frame` to every subscriber of `topic`; returns how many accepted it.
    pub fn publish(&self, topic: &str, frame: &Frame) -> usize {
        let Some(payload) = encode(frame) else {
            return 0;
        };

        let subscribers = self.subscribers.read();
        let mut delivered = 0;
        let mut recipients = 0;
        for subscriber in subscribers.values().filter(|s| s.listens_to(topic)) {
            recipients += 1;
            if subscriber.offer(Arc::clone(&payload)) {
                delivered += 1;
            }
        }

        debug!(topic, recipients, delivered, "published frame");
        delivered
    }

    /// Deliver `frame` to exactly one connection. A gone connection is a silent no-op.
    pub fn send_to_connection(&self, connection_id: &str, frame: &Frame) -> bool {
        let subscriber = self.subscribers.read().get(connection_id).cloned();
        let Some(subscriber) = subscriber else {
            debug!(connection_id, "point-to-point target gone");
            return false;
        };

        match encode(frame) {
            Some(payload) => subscriber.offer(payload),
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

fn encode(frame: &Frame) -> Option<Payload> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize frame");
            None
        }
    }
}
