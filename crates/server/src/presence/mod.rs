//! Live mapping of connections to usernames.
//!
//! The registry only records who is attached. Announcing joins and leaves is
//! the protocol's job.

use crate::models::ConnectionId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<ConnectionId, String>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the mapping for `connection_id`.
    pub fn add(&self, connection_id: &str, username: &str) {
        self.entries
            .write()
            .insert(connection_id.to_string(), username.to_string());
    }

    /// Remove the mapping and return the username it held.
    ///
    /// Absent connections are a no-op: disconnects may race or arrive
    /// without a prior join.
    pub fn remove(&self, connection_id: &str) -> Option<String> {
        self.entries.write().remove(connection_id)
    }

    pub fn username_of(&self, connection_id: &str) -> Option<String> {
        self.entries.read().get(connection_id).cloned()
    }

    /// Distinct usernames across all connections, sorted.
    pub fn active_users(&self) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.entries.read().len()
    }
}
