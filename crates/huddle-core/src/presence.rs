//! Presence tracking for Huddle.
//!
//! The registry maps each joined connection to its display name. The user
//! list is derived from it: one entry per joined connection, in join order,
//! so two windows open under the same name show up twice.

use crate::session::ConnectionId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Presence errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
    /// The connection already has an identity.
    #[error("Connection already joined: {0}")]
    AlreadyJoined(ConnectionId),
}

/// Presence state for a single connection.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    /// Display name.
    pub identity: String,
    /// When the connection joined.
    pub joined_at: DateTime<Utc>,
    /// Join order.
    seq: u64,
}

/// Registry of joined connections.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    /// Map of connection ID to presence state.
    members: HashMap<ConnectionId, PresenceEntry>,
    next_seq: u64,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of joined connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a connection has joined.
    #[must_use]
    pub fn is_joined(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// The identity a connection joined under.
    #[must_use]
    pub fn identity(&self, connection_id: &ConnectionId) -> Option<&str> {
        self.members.get(connection_id).map(|e| e.identity.as_str())
    }

    /// Record that `connection_id` joined as `identity`.
    ///
    /// Identities are not unique; several connections may share one.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has already joined.
    pub fn join(
        &mut self,
        connection_id: &ConnectionId,
        identity: impl Into<String>,
    ) -> Result<(), PresenceError> {
        if self.members.contains_key(connection_id) {
            return Err(PresenceError::AlreadyJoined(connection_id.clone()));
        }

        let entry = PresenceEntry {
            identity: identity.into(),
            joined_at: Utc::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        debug!(connection = %connection_id, identity = %entry.identity, "Presence: member joined");
        self.members.insert(connection_id.clone(), entry);
        Ok(())
    }

    /// Remove a connection from presence.
    ///
    /// Returns the removed entry, if any. Leaving twice is not an error.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<PresenceEntry> {
        let entry = self.members.remove(connection_id);
        if entry.is_some() {
            debug!(connection = %connection_id, "Presence: member left");
        }
        entry
    }

    /// All joined identities in join order, duplicates included.
    #[must_use]
    pub fn current_users(&self) -> Vec<String> {
        let mut entries: Vec<&PresenceEntry> = self.members.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.identity.clone()).collect()
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_join_leave() {
        let mut presence = PresenceRegistry::new();
        let conn: ConnectionId = "conn-1".into();

        presence.join(&conn, "Alice").unwrap();
        assert_eq!(
            presence.join(&conn, "Alice"),
            Err(PresenceError::AlreadyJoined(conn.clone()))
        );

        assert_eq!(presence.count(), 1);
        assert!(presence.is_joined(&conn));
        assert_eq!(presence.identity(&conn), Some("Alice"));

        let entry = presence.leave(&conn).unwrap();
        assert_eq!(entry.identity, "Alice");
        assert!(entry.joined_at <= Utc::now());
        assert!(!presence.is_joined(&conn));
        assert!(presence.leave(&conn).is_none());
        assert!(presence.is_empty());
    }

    #[test]
    fn test_current_users_in_join_order() {
        let mut presence = PresenceRegistry::new();
        for (i, name) in ["Carol", "Alice", "Bob"].iter().enumerate() {
            presence.join(&format!("conn-{i}").into(), *name).unwrap();
        }

        assert_eq!(presence.current_users(), vec!["Carol", "Alice", "Bob"]);
    }

    #[test]
    fn test_shared_identity_counts_twice() {
        let mut presence = PresenceRegistry::new();
        presence.join(&"conn-1".into(), "Alice").unwrap();
        presence.join(&"conn-2".into(), "Alice").unwrap();
        assert_eq!(presence.current_users(), vec!["Alice", "Alice"]);

        presence.leave(&"conn-1".into());
        assert_eq!(presence.current_users(), vec!["Alice"]);
    }
}
