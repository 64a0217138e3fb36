//! The ordered, durably persisted message log.
//!
//! Every mutation writes a full snapshot through the [`Persistence`]
//! backend before it is considered committed. If the write fails the
//! in-memory log is rolled back, so memory never runs ahead of disk.

use crate::message::generate_message_id;
use crate::persist::Persistence;
use chrono::Utc;
use huddle_protocol::{Message, MessageId};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, error, info};

/// Message store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Empty author or text.
    #[error("Invalid message: {0}")]
    Validation(&'static str),

    /// No message with this id.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// The requester is not the message's author.
    #[error("Message {id} does not belong to {requester}")]
    Unauthorized {
        /// The message id.
        id: MessageId,
        /// Who asked for the deletion.
        requester: String,
    },

    /// The durable write failed; the mutation was not committed.
    #[error("Failed to persist message log: {0}")]
    Persistence(#[from] std::io::Error),

    /// The durable log exists but cannot be used.
    #[error("Message log at {location} is corrupt: {reason}")]
    Corrupt {
        /// Where the log lives.
        location: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// The message log.
pub struct MessageStore {
    /// Messages in chronological order.
    messages: Vec<Message>,
    /// Every id handed out or loaded during this store's lifetime.
    seen_ids: HashSet<MessageId>,
    /// Durable snapshot storage.
    backend: Box<dyn Persistence>,
}

impl MessageStore {
    /// Create an empty store on top of `backend` without reading it.
    #[must_use]
    pub fn new(backend: impl Persistence + 'static) -> Self {
        Self {
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            backend: Box::new(backend),
        }
    }

    /// Create a store and restore its contents from `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable log exists but is unreadable.
    pub fn open(backend: impl Persistence + 'static) -> Result<Self, StoreError> {
        let mut store = Self::new(backend);
        store.restore()?;
        Ok(store)
    }

    /// Replace the in-memory log with the durable one.
    ///
    /// A missing log yields an empty store. A malformed log is an error;
    /// history is never silently discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable log exists but is unreadable.
    pub fn restore(&mut self) -> Result<(), StoreError> {
        let messages = self.backend.load()?.unwrap_or_default();

        self.seen_ids.extend(messages.iter().map(|m| m.id.clone()));
        self.messages = messages;

        info!(
            location = %self.backend.location(),
            messages = self.messages.len(),
            "Message log restored"
        );
        Ok(())
    }

    /// Append a message and persist the log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `author` or the trimmed `text`
    /// is empty, or [`StoreError::Persistence`] if the log could not be
    /// saved (the append is rolled back).
    pub fn append(&mut self, author: &str, text: &str) -> Result<Message, StoreError> {
        let message = self.compose(author, text)?;

        self.messages.push(message.clone());
        if let Err(e) = self.backend.save(&self.messages) {
            self.messages.pop();
            error!(id = %message.id, error = %e, "Append not committed");
            return Err(e);
        }

        self.seen_ids.insert(message.id.clone());
        debug!(id = %message.id, author = %message.author, "Message appended");
        Ok(message)
    }

    /// Build a message that is not stored.
    ///
    /// The id is still reserved, so it will never be handed out again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `author` or `text` is empty.
    pub fn ephemeral(&mut self, author: &str, text: &str) -> Result<Message, StoreError> {
        let message = self.compose(author, text)?;
        self.seen_ids.insert(message.id.clone());
        Ok(message)
    }

    /// Remove a message authored by `requester` and persist the log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such message,
    /// [`StoreError::Unauthorized`] if it belongs to someone else, or
    /// [`StoreError::Persistence`] if the log could not be saved (the
    /// removal is rolled back).
    pub fn remove(&mut self, id: &MessageId, requester: &str) -> Result<Message, StoreError> {
        let index = self
            .messages
            .iter()
            .position(|m| &m.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if !self.messages[index].is_authored_by(requester) {
            return Err(StoreError::Unauthorized {
                id: id.clone(),
                requester: requester.to_string(),
            });
        }

        let removed = self.messages.remove(index);
        if let Err(e) = self.backend.save(&self.messages) {
            self.messages.insert(index, removed);
            error!(id = %id, error = %e, "Removal not committed");
            return Err(e);
        }

        debug!(id = %id, "Message removed");
        Ok(removed)
    }

    /// Snapshot of the full log in chronological order.
    #[must_use]
    pub fn load_all(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Write the current log again.
    ///
    /// # Errors
    ///
    /// Returns an error if the log could not be saved.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.backend.save(&self.messages)
    }

    fn compose(&self, author: &str, text: &str) -> Result<Message, StoreError> {
        if author.trim().is_empty() {
            return Err(StoreError::Validation("Author cannot be empty"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::Validation("Message text cannot be empty"));
        }

        let id = loop {
            let id = generate_message_id();
            if !self.seen_ids.contains(&id) {
                break id;
            }
        };

        Ok(Message::new(id, author, text, Utc::now()))
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("messages", &self.messages.len())
            .field("location", &self.backend.location())
            .finish()
    }
}
