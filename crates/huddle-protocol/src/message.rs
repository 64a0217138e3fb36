//! The chat message record.
//!
//! The same shape travels over the wire and is written to the durable log,
//! so field names here are part of the on-disk format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author name used for server-generated messages.
pub const SYSTEM_AUTHOR: &str = "System";

/// Opaque, never-reused message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single chat message.
///
/// Older logs stored the author as `user` and the creation time as
/// `timestamp`; both are accepted when reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Display name of the sender, captured at send time.
    #[serde(alias = "user")]
    pub author: String,
    /// Message body.
    pub text: String,
    /// Server-side creation time.
    #[serde(rename = "createdAt", alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message from already-validated parts.
    #[must_use]
    pub fn new(
        id: MessageId,
        author: impl Into<String>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            author: author.into(),
            text: text.into(),
            created_at,
        }
    }

    /// Whether this message was generated by the server.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.author == SYSTEM_AUTHOR
    }

    /// Whether `identity` owns this message.
    ///
    /// Ownership is by display name only.
    #[must_use]
    pub fn is_authored_by(&self, identity: &str) -> bool {
        self.author == identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_field_names() {
        let msg = Message::new("m-1".into(), "Alice", "hi", Utc::now());
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["id"], "m-1");
        assert_eq!(value["author"], "Alice");
        assert_eq!(value["text"], "hi");
        assert!(value["createdAt"].is_string());
    }

    #[test]
    fn test_legacy_field_aliases() {
        let legacy = r#"{
            "id": "1700000000000_ab12cd",
            "user": "Bob",
            "text": "old message",
            "timestamp": "2023-11-14T22:13:20.000Z"
        }"#;

        let msg: Message = serde_json::from_str(legacy).unwrap();
        assert_eq!(msg.id.as_str(), "1700000000000_ab12cd");
        assert_eq!(msg.author, "Bob");
        assert_eq!(msg.created_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_ownership() {
        let msg = Message::new("m-1".into(), "Alice", "hi", Utc::now());
        assert!(msg.is_authored_by("Alice"));
        assert!(!msg.is_authored_by("alice"));
        assert!(!msg.is_system());

        let sys = Message::new("m-2".into(), SYSTEM_AUTHOR, "Alice joined", Utc::now());
        assert!(sys.is_system());
    }
}
