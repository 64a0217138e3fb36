//! Connection gateway for Huddle server.
//!
//! Each WebSocket connection becomes a hub session: inbound frames are
//! decoded into hub commands, and the connection's outbox is drained back
//! onto the socket. The gateway never touches chat state itself.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use huddle_core::{outbox, BroadcastBus, ConnectionId, Hub, HubHandle, JsonFile};
use huddle_protocol::{
    codec, codes, replay_batches, ClientFrame, Encoding, ServerFrame, PROTOCOL_VERSION,
    REPLAY_BATCH_SIZE,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Submission side of the hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    slots: Arc<ConnectionSlots>,
}

impl AppState {
    /// Create new app state around a running hub.
    #[must_use]
    pub fn new(hub: HubHandle, config: Config) -> Self {
        let slots = Arc::new(ConnectionSlots::new(config.limits.max_connections));
        Self { hub, config, slots }
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.slots.active()
    }
}

/// Bounded count of open connections.
///
/// A slot is reserved before the WebSocket upgrade and held for the life
/// of the connection, so concurrent upgrades cannot overshoot the limit.
struct ConnectionSlots {
    active: AtomicUsize,
    limit: usize,
}

impl ConnectionSlots {
    fn new(limit: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            limit,
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reserve a slot, or `None` when the server is full.
    fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if previous >= self.limit {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(SlotGuard(Arc::clone(self)))
    }
}

/// Releases its connection slot on drop.
struct SlotGuard(Arc<ConnectionSlots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the address cannot be bound, the message log cannot
/// be restored, or the final flush fails.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    serve(listener, config, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Restores the message log, starts the hub, serves connections, then stops
/// the hub and waits for it to flush.
///
/// # Errors
///
/// Returns an error if the message log cannot be restored, the server
/// fails, or the final flush fails.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let store_path = config.store_path();
    let bus = Arc::new(BroadcastBus::new());
    let hub = Hub::init(JsonFile::new(&store_path), bus, config.hub_config())
        .with_context(|| format!("Failed to restore message log from {}", store_path.display()))?;
    let (handle, hub_task) = hub.spawn();

    let state = Arc::new(AppState::new(handle.clone(), config.clone()));
    let app = router(state);

    let addr = listener.local_addr()?;
    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Shutting down hub");
    if handle.shutdown().is_err() {
        warn!("Hub already stopped");
    }
    hub_task
        .await
        .context("Hub task panicked")?
        .context("Failed to flush message log")?;

    served.context("Server error")?;
    info!("Huddle server stopped");
    Ok(())
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => axum::Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": PROTOCOL_VERSION.to_string(),
            "connections": stats.connections,
            "joined": stats.joined,
            "messages": stats.messages,
        }))
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "status": "stopping" })),
        )
            .into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.slots.try_acquire() else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection refused, server full"
        );
        metrics::record_refused();
        return (StatusCode::SERVICE_UNAVAILABLE, "Server full").into_response();
    };

    let max_frame_size = state.config.limits.max_frame_size;
    ws.max_message_size(max_frame_size)
        .max_frame_size(max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: SlotGuard) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let (outbox_tx, mut outbox_rx) = outbox(state.config.limits.outbox_capacity);
    if let Err(e) = state.hub.connect(connection_id.clone(), outbox_tx) {
        warn!(connection = %connection_id, error = %e, "Hub unavailable");
        let frame = ServerFrame::error(e.code(), e.to_string());
        let _ = send_frame(&mut sender, &frame, Encoding::Json).await;
        return;
    }

    // Replies follow whichever encoding the client last used.
    let mut encoding = Encoding::Json;
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            frame = outbox_rx.recv() => {
                let Some(frame) = frame else {
                    debug!(connection = %connection_id, "Outbox closed by hub");
                    break;
                };
                if let Err(e) = deliver(&mut sender, &frame, encoding).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                let replies = match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        let start = Instant::now();
                        metrics::record_frame(text.len(), "inbound");

                        let reply = match codec::decode_json::<ClientFrame>(&text) {
                            Ok(frame) => dispatch(frame, &connection_id, &state),
                            Err(e) => Some(malformed(&connection_id, &e)),
                        };

                        metrics::record_latency(start.elapsed().as_secs_f64());
                        reply.into_iter().collect()
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        let start = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        let mut replies = Vec::new();
                        loop {
                            match codec::decode_from::<ClientFrame>(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    replies.extend(dispatch(frame, &connection_id, &state));
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    replies.push(malformed(&connection_id, &e));
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                        replies
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        Vec::new()
                    }
                    Some(Ok(Message::Pong(_))) => Vec::new(),
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                let mut failed = false;
                for reply in replies {
                    if send_frame(&mut sender, &reply, encoding).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
        }
    }

    if state.hub.disconnect(connection_id.clone()).is_err() {
        debug!(connection = %connection_id, "Hub stopped before disconnect");
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Forward a decoded frame to the hub.
///
/// Returns a frame to send straight back to the client, if any. Everything
/// else, including rejections, arrives through the outbox.
fn dispatch(
    frame: ClientFrame,
    connection_id: &ConnectionId,
    state: &AppState,
) -> Option<ServerFrame> {
    metrics::record_request(frame.kind());

    let submitted = match frame {
        ClientFrame::Join { identity } => state.hub.join(connection_id.clone(), identity),
        ClientFrame::Send { text } => state.hub.send(connection_id.clone(), text),
        ClientFrame::Delete { id } => state.hub.delete(connection_id.clone(), id),
        ClientFrame::Ping { timestamp } => return Some(ServerFrame::Pong { timestamp }),
    };

    submitted.err().map(|e| {
        warn!(connection = %connection_id, error = %e, "Request not queued");
        ServerFrame::error(e.code(), e.to_string())
    })
}

fn malformed(connection_id: &ConnectionId, error: &codec::ProtocolError) -> ServerFrame {
    debug!(connection = %connection_id, error = %error, "Malformed frame");
    ServerFrame::error(codes::MALFORMED, format!("Malformed frame: {error}"))
}

/// Send a frame from the outbox, splitting history into replay batches.
async fn deliver(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
    encoding: Encoding,
) -> Result<()> {
    let ServerFrame::Replay { messages } = frame else {
        return send_frame(sender, frame, encoding).await;
    };

    for batch in replay_batches(messages, REPLAY_BATCH_SIZE) {
        let part = ServerFrame::Replay {
            messages: batch.to_vec(),
        };
        send_frame(sender, &part, encoding).await?;
    }
    Ok(())
}

/// Send a frame to the WebSocket in the given encoding.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
    encoding: Encoding,
) -> Result<()> {
    if let ServerFrame::Error { code, .. } = frame {
        metrics::record_rejection(*code);
    }

    let message = match encoding {
        Encoding::Json => Message::Text(codec::encode_json(frame)?),
        Encoding::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };

    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_slots_respect_limit() {
        let slots = Arc::new(ConnectionSlots::new(2));

        let first = slots.try_acquire().unwrap();
        let _second = slots.try_acquire().unwrap();
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.active(), 2);

        drop(first);
        assert_eq!(slots.active(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn test_slots_zero_limit_refuses() {
        let slots = Arc::new(ConnectionSlots::new(0));
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.active(), 0);
    }

    #[test]
    fn test_concurrent_upgrades_never_overshoot() {
        let slots = Arc::new(ConnectionSlots::new(3));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    slots.try_acquire()
                })
            })
            .collect();

        let guards: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 3);
        assert_eq!(slots.active(), 3);

        drop(guards);
        assert_eq!(slots.active(), 0);
    }
}
