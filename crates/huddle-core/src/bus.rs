//! Fan-out of server frames to connected clients.
//!
//! Each connection owns a bounded outbox. Publishing never blocks: a
//! connection whose outbox is full or closed misses the frame, and delivery
//! to the others carries on.

use crate::session::ConnectionId;
use dashmap::DashMap;
use huddle_protocol::ServerFrame;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Default outbox capacity, in frames.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Sending half of a connection's outbox.
pub type Outbox = mpsc::Sender<Arc<ServerFrame>>;

/// Receiving half of a connection's outbox.
pub type OutboxReceiver = mpsc::Receiver<Arc<ServerFrame>>;

/// Create a connection outbox.
#[must_use]
pub fn outbox(capacity: usize) -> (Outbox, OutboxReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Registry of connection outboxes.
#[derive(Debug, Default)]
pub struct BroadcastBus {
    outboxes: DashMap<ConnectionId, Outbox>,
}

impl BroadcastBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbox.
    ///
    /// Returns `false` if the connection was already registered, in which
    /// case the new outbox replaces the old one.
    pub fn register(&self, connection_id: ConnectionId, outbox: Outbox) -> bool {
        debug!(connection = %connection_id, "Outbox registered");
        self.outboxes.insert(connection_id, outbox).is_none()
    }

    /// Remove a connection's outbox.
    ///
    /// Returns `true` if the connection was registered.
    pub fn unregister(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.outboxes.remove(connection_id).is_some();
        if removed {
            debug!(connection = %connection_id, "Outbox unregistered");
        }
        removed
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Deliver a frame to every registered connection except `exclude`.
    ///
    /// Returns the number of connections that accepted the frame.
    pub fn publish(&self, frame: ServerFrame, exclude: Option<&ConnectionId>) -> usize {
        let kind = frame.kind();
        let frame = Arc::new(frame);

        let delivered = self
            .outboxes
            .iter()
            .filter(|entry| Some(entry.key()) != exclude)
            .filter(|entry| deliver(entry.key(), entry.value(), Arc::clone(&frame)))
            .count();

        trace!(frame = kind, recipients = delivered, "Published frame");
        delivered
    }

    /// Deliver a frame to a single connection.
    ///
    /// Returns `true` if the connection accepted the frame.
    pub fn send_to(&self, connection_id: &ConnectionId, frame: ServerFrame) -> bool {
        match self.outboxes.get(connection_id) {
            Some(outbox) => deliver(connection_id, &outbox, Arc::new(frame)),
            None => {
                trace!(connection = %connection_id, "Send to unregistered connection");
                false
            }
        }
    }
}

fn deliver(connection_id: &ConnectionId, outbox: &Outbox, frame: Arc<ServerFrame>) -> bool {
    match outbox.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            warn!(
                connection = %connection_id,
                frame = frame.kind(),
                "Outbox full, frame dropped"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(connection = %connection_id, "Outbox closed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(names: &[&str]) -> ServerFrame {
        ServerFrame::UserList {
            users: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_register_unregister() {
        let bus = BroadcastBus::new();
        let (tx, _rx) = outbox(8);

        assert!(bus.register("conn-1".into(), tx.clone()));
        assert!(!bus.register("conn-1".into(), tx));
        assert_eq!(bus.connection_count(), 1);

        assert!(bus.unregister(&"conn-1".into()));
        assert!(!bus.unregister(&"conn-1".into()));
        assert_eq!(bus.connection_count(), 0);
    }

    #[test]
    fn test_publish_reaches_everyone() {
        let bus = BroadcastBus::new();
        let (tx1, mut rx1) = outbox(8);
        let (tx2, mut rx2) = outbox(8);
        bus.register("conn-1".into(), tx1);
        bus.register("conn-2".into(), tx2);

        assert_eq!(bus.publish(users(&["Alice"]), None), 2);
        assert_eq!(*rx1.try_recv().unwrap(), users(&["Alice"]));
        assert_eq!(*rx2.try_recv().unwrap(), users(&["Alice"]));
    }

    #[test]
    fn test_publish_excludes() {
        let bus = BroadcastBus::new();
        let (tx1, mut rx1) = outbox(8);
        let (tx2, mut rx2) = outbox(8);
        bus.register("conn-1".into(), tx1);
        bus.register("conn-2".into(), tx2);

        assert_eq!(bus.publish(users(&[]), Some(&"conn-1".into())), 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_full_outbox_does_not_block_others() {
        let bus = BroadcastBus::new();
        let (slow, mut slow_rx) = outbox(1);
        let (fast, mut fast_rx) = outbox(8);
        bus.register("slow".into(), slow);
        bus.register("fast".into(), fast);

        assert_eq!(bus.publish(users(&["a"]), None), 2);
        assert_eq!(bus.publish(users(&["b"]), None), 1);

        assert_eq!(*slow_rx.try_recv().unwrap(), users(&["a"]));
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(*fast_rx.try_recv().unwrap(), users(&["a"]));
        assert_eq!(*fast_rx.try_recv().unwrap(), users(&["b"]));
    }

    #[test]
    fn test_closed_outbox_is_skipped() {
        let bus = BroadcastBus::new();
        let (gone, gone_rx) = outbox(8);
        let (live, mut live_rx) = outbox(8);
        bus.register("gone".into(), gone);
        bus.register("live".into(), live);
        drop(gone_rx);

        assert_eq!(bus.publish(users(&[]), None), 1);
        assert!(live_rx.try_recv().is_ok());
    }

    #[test]
    fn test_send_to() {
        let bus = BroadcastBus::new();
        let (tx1, mut rx1) = outbox(8);
        let (tx2, mut rx2) = outbox(8);
        bus.register("conn-1".into(), tx1);
        bus.register("conn-2".into(), tx2);

        assert!(bus.send_to(&"conn-1".into(), users(&[])));
        assert!(!bus.send_to(&"conn-3".into(), users(&[])));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
