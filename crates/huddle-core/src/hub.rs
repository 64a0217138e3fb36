//! The central sequential processor.
//!
//! The hub owns the message store, the presence registry, the session table
//! and a handle to the broadcast bus. Gateways submit [`Command`]s through a
//! [`HubHandle`]; the hub applies them strictly one at a time, in arrival
//! order, on its own thread. A mutation is broadcast only after it has been
//! persisted.

use crate::bus::{BroadcastBus, Outbox};
use crate::message::{validate_identity, validate_text, MAX_IDENTITY_LENGTH, MAX_TEXT_LENGTH};
use crate::persist::Persistence;
use crate::presence::{PresenceError, PresenceRegistry};
use crate::session::{ConnectionId, Session, SessionError};
use crate::store::{MessageStore, StoreError};
use chrono::Utc;
use huddle_protocol::{codes, MessageId, ServerFrame, PROTOCOL_VERSION, SYSTEM_AUTHOR};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Message store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Operation not valid in the session's state.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Presence registry rejected the operation.
    #[error(transparent)]
    Presence(#[from] PresenceError),

    /// Display name failed validation.
    #[error("Invalid display name: {0}")]
    InvalidIdentity(&'static str),

    /// Message text failed validation.
    #[error("Invalid message: {0}")]
    InvalidText(&'static str),

    /// No open session for this connection.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The hub has stopped.
    #[error("Hub is not running")]
    Closed,
}

impl HubError {
    /// Wire error code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            HubError::Store(StoreError::Validation(_))
            | HubError::InvalidIdentity(_)
            | HubError::InvalidText(_) => codes::VALIDATION,
            HubError::Store(StoreError::NotFound(_)) => codes::NOT_FOUND,
            HubError::Store(StoreError::Unauthorized { .. }) => codes::UNAUTHORIZED,
            HubError::Store(StoreError::Persistence(_) | StoreError::Corrupt { .. }) => {
                codes::PERSISTENCE
            }
            HubError::Session(_) | HubError::Presence(_) | HubError::UnknownConnection(_) => {
                codes::INVALID_STATE
            }
            HubError::Closed => codes::UNAVAILABLE,
        }
    }

    /// Whether the error means durable state could not be written.
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            HubError::Store(StoreError::Persistence(_) | StoreError::Corrupt { .. })
        )
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum message length, in characters.
    pub max_text_length: usize,
    /// Maximum display name length, in characters.
    pub max_identity_length: usize,
    /// Whether "left the chat" notices are written to the log.
    pub persist_departures: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_text_length: MAX_TEXT_LENGTH,
            max_identity_length: MAX_IDENTITY_LENGTH,
            persist_departures: true,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    /// Open connections.
    pub connections: usize,
    /// Connections that have joined.
    pub joined: usize,
    /// Messages in the log.
    pub messages: usize,
}

/// Inbound events, one per client action or transport event.
#[derive(Debug)]
pub enum Command {
    /// A new connection was accepted.
    Connect {
        /// Connection identifier, unique among open connections.
        connection_id: ConnectionId,
        /// Where frames for this connection go.
        outbox: Outbox,
    },
    /// The client asked to join under a display name.
    Join {
        /// Originating connection.
        connection_id: ConnectionId,
        /// Requested display name.
        identity: String,
    },
    /// The client sent a message.
    Send {
        /// Originating connection.
        connection_id: ConnectionId,
        /// Message body.
        text: String,
    },
    /// The client asked to delete a message.
    Delete {
        /// Originating connection.
        connection_id: ConnectionId,
        /// Message to delete.
        id: MessageId,
    },
    /// The transport went away.
    Disconnect {
        /// The closed connection.
        connection_id: ConnectionId,
    },
    /// Report statistics.
    Stats {
        /// Where to send them.
        reply: oneshot::Sender<HubStats>,
    },
    /// Stop processing and tear down.
    Shutdown,
}

/// The central processor.
pub struct Hub {
    store: MessageStore,
    presence: PresenceRegistry,
    sessions: HashMap<ConnectionId, Session>,
    bus: Arc<BroadcastBus>,
    config: HubConfig,
}

impl Hub {
    /// Restore the message log and build a hub around it.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable log exists but cannot be read. The
    /// server must not start in that case.
    pub fn init(
        backend: impl Persistence + 'static,
        bus: Arc<BroadcastBus>,
        config: HubConfig,
    ) -> Result<Self, HubError> {
        let store = MessageStore::open(backend)?;
        info!(messages = store.len(), ?config, "Hub initialized");

        Ok(Self {
            store,
            presence: PresenceRegistry::new(),
            sessions: HashMap::new(),
            bus,
            config,
        })
    }

    /// Move the hub onto a dedicated blocking thread.
    ///
    /// Returns the handle used to submit commands and the task that resolves
    /// once the hub has torn down.
    #[must_use]
    pub fn spawn(self) -> (HubHandle, JoinHandle<Result<(), HubError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::task::spawn_blocking(move || self.run(rx));
        (HubHandle { tx }, task)
    }

    /// Apply commands until `Shutdown` arrives or every handle is dropped,
    /// then tear down.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) -> Result<(), HubError> {
        while let Some(command) = rx.blocking_recv() {
            if !self.handle(command) {
                break;
            }
        }
        self.teardown()
    }

    /// Apply a single command.
    ///
    /// Returns `false` once the hub should stop.
    pub fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connect {
                connection_id,
                outbox,
            } => self.connect(connection_id, outbox),
            Command::Join {
                connection_id,
                identity,
            } => {
                let result = self.join(&connection_id, &identity);
                self.settle(&connection_id, "join", result);
            }
            Command::Send {
                connection_id,
                text,
            } => {
                let result = self.send(&connection_id, &text);
                self.settle(&connection_id, "send", result);
            }
            Command::Delete { connection_id, id } => {
                let result = self.delete(&connection_id, &id);
                self.settle(&connection_id, "delete", result);
            }
            Command::Disconnect { connection_id } => self.disconnect(&connection_id),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Open an unjoined session and replay history to it.
    pub fn connect(&mut self, connection_id: ConnectionId, outbox: Outbox) {
        if self.sessions.contains_key(&connection_id) {
            warn!(connection = %connection_id, "Duplicate connection id ignored");
            return;
        }

        self.bus.register(connection_id.clone(), outbox);
        self.sessions
            .insert(connection_id.clone(), Session::new(connection_id.clone()));

        self.bus.send_to(
            &connection_id,
            ServerFrame::welcome(connection_id.as_str(), PROTOCOL_VERSION.to_string()),
        );
        self.bus.send_to(
            &connection_id,
            ServerFrame::Replay {
                messages: self.store.load_all(),
            },
        );
        self.bus.send_to(
            &connection_id,
            ServerFrame::UserList {
                users: self.presence.current_users(),
            },
        );

        debug!(connection = %connection_id, replayed = self.store.len(), "Session opened");
    }

    /// Join the chat under `identity`.
    ///
    /// # Errors
    ///
    /// Fails if the session is not unjoined, the name is invalid, or the
    /// join notice cannot be persisted. Nothing changes on failure.
    pub fn join(&mut self, connection_id: &ConnectionId, identity: &str) -> Result<(), HubError> {
        self.session(connection_id)?.ensure_can_join()?;
        let identity = validate_identity(identity, self.config.max_identity_length)
            .map_err(HubError::InvalidIdentity)?
            .to_string();

        let notice = self
            .store
            .append(SYSTEM_AUTHOR, &format!("{identity} joined the chat."))?;

        self.session_mut(connection_id)?.join(identity.clone())?;
        self.presence.join(connection_id, identity.clone())?;

        info!(connection = %connection_id, identity = %identity, "Joined");
        self.publish_users();
        self.bus.publish(ServerFrame::message(notice), None);
        Ok(())
    }

    /// Append a message from a joined session and broadcast it.
    ///
    /// # Errors
    ///
    /// Fails if the session has not joined, the text is invalid, or the
    /// message cannot be persisted.
    pub fn send(&mut self, connection_id: &ConnectionId, text: &str) -> Result<(), HubError> {
        let author = self.session(connection_id)?.require_joined()?.to_string();
        let text =
            validate_text(text, self.config.max_text_length).map_err(HubError::InvalidText)?;

        let message = self.store.append(&author, text)?;
        debug!(connection = %connection_id, id = %message.id, "Message committed");

        self.bus.publish(ServerFrame::message(message), None);
        Ok(())
    }

    /// Delete one of the session's own messages and broadcast the removal.
    ///
    /// Ownership is by display name: any session joined under the author's
    /// name may delete the message.
    ///
    /// # Errors
    ///
    /// Fails if the session has not joined, the message does not exist or
    /// belongs to someone else, or the removal cannot be persisted.
    pub fn delete(&mut self, connection_id: &ConnectionId, id: &MessageId) -> Result<(), HubError> {
        let identity = self.session(connection_id)?.require_joined()?.to_string();

        self.store.remove(id, &identity)?;
        debug!(connection = %connection_id, id = %id, "Message deleted");

        self.bus
            .publish(ServerFrame::MessageDeleted { id: id.clone() }, None);
        Ok(())
    }

    /// Close a session. Unknown connections are ignored.
    pub fn disconnect(&mut self, connection_id: &ConnectionId) {
        self.bus.unregister(connection_id);

        let Some(mut session) = self.sessions.remove(connection_id) else {
            debug!(connection = %connection_id, "Disconnect for unknown connection");
            return;
        };

        let connected_secs = (Utc::now() - session.connected_at()).num_seconds();

        if let Some(identity) = session.close() {
            let joined_secs = self
                .presence
                .leave(connection_id)
                .map(|entry| (Utc::now() - entry.joined_at).num_seconds());

            let text = format!("{identity} left the chat.");
            let notice = if self.config.persist_departures {
                self.store.append(SYSTEM_AUTHOR, &text)
            } else {
                self.store.ephemeral(SYSTEM_AUTHOR, &text)
            };
            match notice {
                Ok(message) => {
                    self.bus.publish(ServerFrame::message(message), None);
                }
                Err(e) => {
                    error!(connection = %connection_id, error = %e, "Departure notice not committed");
                }
            }

            info!(
                connection = %connection_id,
                identity = %identity,
                joined_secs = joined_secs.unwrap_or_default(),
                "Left"
            );
            self.publish_users();
        }

        debug!(connection = %connection_id, connected_secs, "Session closed");
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.sessions.len(),
            joined: self.presence.count(),
            messages: self.store.len(),
        }
    }

    /// All joined identities, in join order.
    #[must_use]
    pub fn current_users(&self) -> Vec<String> {
        self.presence.current_users()
    }

    /// Read-only access to the message log.
    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Drop every session and flush the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn teardown(mut self) -> Result<(), HubError> {
        let open = self.sessions.len();
        for connection_id in self.sessions.keys() {
            self.bus.unregister(connection_id);
        }
        self.sessions.clear();
        self.presence.clear();

        self.store.flush()?;
        info!(
            sessions = open,
            messages = self.store.len(),
            "Hub stopped, message log flushed"
        );
        Ok(())
    }

    fn session(&self, connection_id: &ConnectionId) -> Result<&Session, HubError> {
        self.sessions
            .get(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.clone()))
    }

    fn session_mut(&mut self, connection_id: &ConnectionId) -> Result<&mut Session, HubError> {
        self.sessions
            .get_mut(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.clone()))
    }

    fn publish_users(&self) {
        self.bus.publish(
            ServerFrame::UserList {
                users: self.presence.current_users(),
            },
            None,
        );
    }

    /// Report a rejected request to its originator only.
    fn settle(&self, connection_id: &ConnectionId, op: &str, result: Result<(), HubError>) {
        let Err(e) = result else {
            return;
        };

        match &e {
            HubError::UnknownConnection(_) => {
                debug!(connection = %connection_id, op, "Ignoring request from closed connection");
                return;
            }
            e if e.is_persistence() => {
                error!(connection = %connection_id, op, error = %e, "Request not committed");
            }
            e => {
                warn!(connection = %connection_id, op, error = %e, "Request rejected");
            }
        }

        self.bus
            .send_to(connection_id, ServerFrame::error(e.code(), e.to_string()));
    }
}

/// Cloneable submission side of a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl HubHandle {
    /// Queue a command.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub fn submit(&self, command: Command) -> Result<(), HubError> {
        self.tx.send(command).map_err(|_| HubError::Closed)
    }

    /// Announce a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub fn connect(&self, connection_id: ConnectionId, outbox: Outbox) -> Result<(), HubError> {
        self.submit(Command::Connect {
            connection_id,
            outbox,
        })
    }

    /// Queue a join request.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub fn join(&self, connection_id: ConnectionId, identity: String) -> Result<(), HubError> {
        self.submit(Command::Join {
            connection_id,
            identity,
        })
    }

    /// Queue a message.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub fn send(&self, connection_id: ConnectionId, text: String) -> Result<(), HubError> {
        self.submit(Command::Send {
            connection_id,
            text,
        })
    }

    /// Queue a delete request.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub fn delete(&self, connection_id: ConnectionId, id: MessageId) -> Result<(), HubError> {
        self.submit(Command::Delete { connection_id, id })
    }

    /// Announce that a connection closed.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Result<(), HubError> {
        self.submit(Command::Disconnect { connection_id })
    }

    /// Ask the hub for its statistics.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Stats { reply })?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Ask the hub to stop after the commands already queued.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has already stopped.
    pub fn shutdown(&self) -> Result<(), HubError> {
        self.submit(Command::Shutdown)
    }

    /// Whether the hub has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
