//! Shared fixtures for Huddle benchmarks.

use huddle_core::{
    outbox, BroadcastBus, ConnectionId, Hub, HubConfig, MemoryBackend, OutboxReceiver,
};
use std::sync::Arc;

/// A connected client as seen by the hub: its id and outbox.
pub type BenchClient = (ConnectionId, OutboxReceiver);

/// Build an in-memory hub with `clients` joined sessions named `user-N`.
///
/// Outboxes are drained before returning.
///
/// # Panics
///
/// Panics if a join fails, which cannot happen with an in-memory backend.
#[must_use]
pub fn joined_hub(clients: usize, outbox_capacity: usize) -> (Hub, Vec<BenchClient>) {
    let bus = Arc::new(BroadcastBus::new());
    let mut hub = match Hub::init(MemoryBackend::new(), bus, HubConfig::default()) {
        Ok(hub) => hub,
        Err(e) => panic!("in-memory hub failed to start: {e}"),
    };

    let mut connected = Vec::with_capacity(clients);
    for i in 0..clients {
        let connection_id = ConnectionId::new(format!("bench-{i}"));
        let (tx, rx) = outbox(outbox_capacity);
        hub.connect(connection_id.clone(), tx);
        if let Err(e) = hub.join(&connection_id, &format!("user-{i}")) {
            panic!("join failed: {e}");
        }
        connected.push((connection_id, rx));
    }

    for (_, rx) in &mut connected {
        drain(rx);
    }
    (hub, connected)
}

/// Discard everything queued in an outbox, returning how many frames there were.
pub fn drain(rx: &mut OutboxReceiver) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}
