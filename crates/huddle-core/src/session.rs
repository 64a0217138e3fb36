//! Per-connection session lifecycle.
//!
//! A session starts `Unjoined`, becomes `Joined` once it adopts a display
//! name, and ends `Closed` when the transport goes away:
//!
//! ```text
//! Unjoined ──join──▶ Joined
//!     │                 │
//!     └──disconnect──┬──┘
//!                    ▼
//!                 Closed
//! ```

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no display name yet.
    Unjoined,
    /// Has a display name; may send and delete.
    Joined,
    /// Transport gone. Terminal.
    Closed,
}

/// Operations attempted in the wrong session state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Send or delete before joining.
    #[error("Join the chat first")]
    NotJoined,

    /// A second join.
    #[error("Already joined as {0}")]
    AlreadyJoined(String),

    /// Anything after disconnect.
    #[error("Connection is closed")]
    Closed,
}

/// Server-side state for one open connection.
#[derive(Debug, Clone)]
pub struct Session {
    connection_id: ConnectionId,
    identity: Option<String>,
    state: SessionState,
    connected_at: DateTime<Utc>,
}

impl Session {
    /// Create an unjoined session.
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            identity: None,
            state: SessionState::Unjoined,
            connected_at: Utc::now(),
        }
    }

    /// The connection this session belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The display name, once joined.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When the connection was opened.
    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Check that a join would be accepted, without performing it.
    ///
    /// # Errors
    ///
    /// Returns an error unless the session is `Unjoined`.
    pub fn ensure_can_join(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Unjoined => Ok(()),
            SessionState::Joined => Err(SessionError::AlreadyJoined(
                self.identity.clone().unwrap_or_default(),
            )),
            SessionState::Closed => Err(SessionError::Closed),
        }
    }

    /// Transition `Unjoined` → `Joined`. The identity is set exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error unless the session is `Unjoined`.
    pub fn join(&mut self, identity: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_can_join()?;
        self.identity = Some(identity.into());
        self.state = SessionState::Joined;
        Ok(())
    }

    /// The identity to act as, if the session may send and delete.
    ///
    /// # Errors
    ///
    /// Returns an error unless the session is `Joined`.
    pub fn require_joined(&self) -> Result<&str, SessionError> {
        match (self.state, self.identity.as_deref()) {
            (SessionState::Joined, Some(identity)) => Ok(identity),
            (SessionState::Closed, _) => Err(SessionError::Closed),
            _ => Err(SessionError::NotJoined),
        }
    }

    /// Transition to `Closed` from any state.
    ///
    /// Returns the identity if the session had joined. Closing twice
    /// returns `None` the second time.
    pub fn close(&mut self) -> Option<String> {
        let was_joined = self.state == SessionState::Joined;
        self.state = SessionState::Closed;
        if was_joined {
            self.identity.clone()
        } else {
            None
        }
    }
}
