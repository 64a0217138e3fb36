//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle chat server.
//!
//! This crate defines the frames exchanged between Huddle clients and the
//! server, the shape of a chat message (shared by the wire and the on-disk
//! log), the codecs, and protocol versioning.
//!
//! ## Frame Types
//!
//! - `Join` / `Send` / `Delete` - Client requests
//! - `Replay` / `Message` / `MessageDeleted` - Message log events
//! - `UserList` - Presence changes
//! - `Welcome` / `Error` / `Ping` / `Pong` - Session housekeeping
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientFrame};
//!
//! let frame = ClientFrame::send("Hello, world!");
//!
//! // Browsers speak JSON text...
//! let text = codec::encode_json(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode_json(&text).unwrap();
//! assert_eq!(frame, decoded);
//!
//! // ...native clients speak length-prefixed MessagePack.
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ClientFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod message;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{codes, replay_batches, ClientFrame, ServerFrame, REPLAY_BATCH_SIZE};
pub use message::{Message, MessageId, SYSTEM_AUTHOR};
pub use version::{Version, VersionError, PROTOCOL_VERSION};
