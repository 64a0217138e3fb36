//! # huddle-core
//!
//! Core state and event processing for the Huddle chat server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **MessageStore** - Ordered, durably persisted message log
//! - **PresenceRegistry** - Which connections have joined, and as whom
//! - **Session** - Per-connection lifecycle (unjoined, joined, closed)
//! - **BroadcastBus** - Fan-out of server frames to connection outboxes
//! - **Hub** - Sequential processor that applies one command at a time
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  Command  ┌─────────────┐     ┌──────────────┐
//! │  Gateway    │──────────▶│     Hub     │────▶│ MessageStore │──▶ disk
//! └─────────────┘           └─────────────┘     └──────────────┘
//!        ▲                     │       │
//!        │                     ▼       ▼
//!        │            ┌──────────┐  ┌──────────────────┐
//!        └────────────│   Bus    │  │ PresenceRegistry │
//!         ServerFrame └──────────┘  └──────────────────┘
//! ```

pub mod bus;
pub mod hub;
pub mod message;
pub mod persist;
pub mod presence;
pub mod session;
pub mod store;

pub use bus::{outbox, BroadcastBus, Outbox, OutboxReceiver};
pub use hub::{Command, Hub, HubConfig, HubError, HubHandle, HubStats};
pub use persist::{JsonFile, MemoryBackend, Persistence};
pub use presence::{PresenceError, PresenceRegistry};
pub use session::{ConnectionId, Session, SessionError, SessionState};
pub use store::{MessageStore, StoreError};
