//! Frame types for the Huddle protocol.
//!
//! Frames are the fundamental unit of communication. Clients send
//! [`ClientFrame`]s and receive [`ServerFrame`]s; both are internally
//! tagged by a `type` field so they read naturally as JSON.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId};

/// Error codes carried by [`ServerFrame::Error`].
pub mod codes {
    /// Empty or over-long text or identity.
    pub const VALIDATION: u16 = 4000;
    /// Operation not valid in the session's current state.
    pub const INVALID_STATE: u16 = 4001;
    /// Delete of a message owned by someone else.
    pub const UNAUTHORIZED: u16 = 4003;
    /// Delete of a message that does not exist.
    pub const NOT_FOUND: u16 = 4004;
    /// Frame could not be decoded.
    pub const MALFORMED: u16 = 4100;
    /// Durable write failed; the operation was not committed.
    pub const PERSISTENCE: u16 = 5000;
    /// The server is shutting down or over capacity.
    pub const UNAVAILABLE: u16 = 5030;
}

/// Target encoded size of one replay frame (256 KiB).
pub const REPLAY_BATCH_SIZE: usize = 256 * 1024;

/// `{"type":"replay","messages":[` plus the closing `]}`.
const REPLAY_FRAME_OVERHEAD: usize = 32;

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Adopt a display name for this connection.
    #[serde(rename = "join")]
    Join {
        /// Requested display name.
        identity: String,
    },

    /// Broadcast a text message.
    #[serde(rename = "send")]
    Send {
        /// Message body.
        text: String,
    },

    /// Delete one of the sender's own messages.
    #[serde(rename = "delete")]
    Delete {
        /// ID of the message to delete.
        id: MessageId,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp, echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Short name of the frame kind, for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Join { .. } => "join",
            ClientFrame::Send { .. } => "send",
            ClientFrame::Delete { .. } => "delete",
            ClientFrame::Ping { .. } => "ping",
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(identity: impl Into<String>) -> Self {
        ClientFrame::Join {
            identity: identity.into(),
        }
    }

    /// Create a new Send frame.
    #[must_use]
    pub fn send(text: impl Into<String>) -> Self {
        ClientFrame::Send { text: text.into() }
    }

    /// Create a new Delete frame.
    #[must_use]
    pub fn delete(id: impl Into<MessageId>) -> Self {
        ClientFrame::Delete { id: id.into() }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        ClientFrame::Ping { timestamp }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// First frame on every connection.
    #[serde(rename = "welcome")]
    Welcome {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Server protocol version.
        version: String,
    },

    /// Message history, sent to a newly connected client.
    ///
    /// Long histories arrive as several consecutive replay frames; the
    /// `user_list` that follows marks the end.
    #[serde(rename = "replay")]
    Replay {
        /// Messages in chronological order.
        messages: Vec<Message>,
    },

    /// A newly committed message.
    #[serde(rename = "message")]
    Message {
        /// The message.
        message: Message,
    },

    /// A message was removed from the log.
    #[serde(rename = "message_deleted")]
    MessageDeleted {
        /// ID of the removed message.
        id: MessageId,
    },

    /// The set of joined users changed.
    #[serde(rename = "user_list")]
    UserList {
        /// Display names, one entry per joined session.
        users: Vec<String>,
    },

    /// A request from this client was rejected.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Short name of the frame kind, for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Welcome { .. } => "welcome",
            ServerFrame::Replay { .. } => "replay",
            ServerFrame::Message { .. } => "message",
            ServerFrame::MessageDeleted { .. } => "message_deleted",
            ServerFrame::UserList { .. } => "user_list",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Create a new Welcome frame.
    #[must_use]
    pub fn welcome(connection_id: impl Into<String>, version: impl Into<String>) -> Self {
        ServerFrame::Welcome {
            connection_id: connection_id.into(),
            version: version.into(),
        }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(message: Message) -> Self {
        ServerFrame::Message { message }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }
}

/// Split history into consecutive batches whose replay frames each encode
/// to at most `max_bytes`.
///
/// Order is preserved and every message lands in exactly one batch. A
/// message too large for any batch travels alone. Empty history still
/// yields one empty batch, so a client always sees at least one replay.
#[must_use]
pub fn replay_batches(messages: &[Message], max_bytes: usize) -> Vec<&[Message]> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut size = REPLAY_FRAME_OVERHEAD;

    for (i, message) in messages.iter().enumerate() {
        // JSON is never smaller than MessagePack, so it bounds both encodings.
        let encoded = serde_json::to_vec(message).map_or(0, |bytes| bytes.len()) + 1;
        if i > start && size + encoded > max_bytes {
            batches.push(&messages[start..i]);
            start = i;
            size = REPLAY_FRAME_OVERHEAD;
        }
        size += encoded;
    }

    batches.push(&messages[start..]);
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn history(count: usize, text_len: usize) -> Vec<Message> {
        (0..count)
            .map(|i| Message::new(format!("m-{i}").into(), "Alice", "x".repeat(text_len), Utc::now()))
            .collect()
    }

    #[test]
    fn test_replay_batches_preserve_order_and_size() {
        let messages = history(600, 2000);
        let batches = replay_batches(&messages, REPLAY_BATCH_SIZE);

        assert!(batches.len() > 1);
        let rejoined: Vec<Message> = batches.iter().flat_map(|b| b.iter().cloned()).collect();
        assert_eq!(rejoined, messages);

        for batch in &batches {
            let frame = ServerFrame::Replay {
                messages: batch.to_vec(),
            };
            let json = serde_json::to_string(&frame).unwrap();
            assert!(json.len() <= REPLAY_BATCH_SIZE, "batch encodes to {}", json.len());
            assert!(rmp_serde::to_vec_named(&frame).unwrap().len() <= REPLAY_BATCH_SIZE);
        }
    }

    #[test]
    fn test_replay_batches_small_and_empty_history() {
        let empty: Vec<Message> = Vec::new();
        let batches = replay_batches(&empty, REPLAY_BATCH_SIZE);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());

        let messages = history(3, 10);
        assert_eq!(replay_batches(&messages, REPLAY_BATCH_SIZE), vec![&messages[..]]);
    }

    #[test]
    fn test_oversized_message_travels_alone() {
        let messages = history(3, 500);
        let batches = replay_batches(&messages, 100);

        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn test_client_frame_json_shape() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "join", "identity": "Alice"})).unwrap();
        assert_eq!(frame, ClientFrame::join("Alice"));
        assert_eq!(frame.kind(), "join");

        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "delete", "id": "m-1"})).unwrap();
        assert_eq!(frame, ClientFrame::delete("m-1"));

        let frame: ClientFrame = serde_json::from_value(json!({"type": "ping"})).unwrap();
        assert_eq!(frame, ClientFrame::ping(None));
    }

    #[test]
    fn test_unknown_client_frame_rejected() {
        let result: Result<ClientFrame, _> =
            serde_json::from_value(json!({"type": "subscribe", "channel": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_frame_json_shape() {
        let value = serde_json::to_value(ServerFrame::UserList {
            users: vec!["Alice".into(), "Alice".into()],
        })
        .unwrap();
        assert_eq!(value, json!({"type": "user_list", "users": ["Alice", "Alice"]}));

        let value = serde_json::to_value(ServerFrame::error(codes::NOT_FOUND, "gone")).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], 4004);
    }
}
