//! End-to-end chat benchmark for Huddle.
//!
//! Connects a crowd of clients to a running server, joins them all, then has
//! every client send as fast as the server accepts and counts the messages
//! that come back through the broadcast.

use futures_util::{SinkExt, Stream, StreamExt};
use huddle_protocol::{codec, ClientFrame, ServerFrame, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Huddle End-to-End Chat Benchmark                     ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("║  Every message is persisted; use a scratch store path.       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_chat_benchmark(num_clients, url).await;
}

async fn run_chat_benchmark(num_clients: usize, url: String) {
    println!("📊 Chat Benchmark: {} clients against {}", num_clients, url);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, received, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    barrier.wait().await;
    println!("✓ All {} clients joined", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let deliveries = received.load(Ordering::SeqCst);

    // Each committed message is delivered to every client.
    let deliveries_per_sec = deliveries as f64 / elapsed.as_secs_f64();
    let commits_per_sec = deliveries_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Deliveries:           {:>10}                           ║",
        deliveries
    );
    println!(
        "║  Deliveries:           {:>10.0} msg/s                    ║",
        deliveries_per_sec
    );
    println!(
        "║  Committed:            {:>10.0} msg/s                    ║",
        commits_per_sec
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // Welcome carries the server's protocol version.
    let welcome = next_frame(&mut receiver).await?;
    if let ServerFrame::Welcome { version, .. } = &welcome {
        Version::check(version)?;
    }

    let name = format!("bench-{client_id}");
    let join = codec::encode_json(&ClientFrame::join(name.as_str()))?;
    sender.send(Message::Text(join)).await?;

    // Wait until our own join notice comes back.
    loop {
        if let ServerFrame::Message { message } = next_frame(&mut receiver).await? {
            if message.text == format!("{name} joined the chat.") {
                break;
            }
        }
    }

    barrier.wait().await;

    let payload = codec::encode_json(&ClientFrame::send("x".repeat(64)))?;
    let send_msg = Message::Text(payload);

    let recv_count = received.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(text)) = result {
                if let Ok(ServerFrame::Message { .. }) = codec::decode_json::<ServerFrame>(&text) {
                    recv_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    loop {
        if sender.send(send_msg.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

async fn next_frame<S>(receiver: &mut S) -> Result<ServerFrame, BoxError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => return Ok(codec::decode_json(&text)?),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed".into()),
        }
    }
}
