//! End-to-end throughput benchmark for the relay.
//!
//! Connects a number of WebSocket clients to a running server, has every
//! client send as fast as it can, and counts deliveries across all clients.
//!
//! ```bash
//! relay &
//! e2e_throughput 16 ws://127.0.0.1:50051/ws
//! ```

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, ChatMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:50051/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Relay end-to-end throughput");
    println!("  server:  {}", url);
    println!("  clients: {}", num_clients);
    println!("  warmup {}s, measure {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let sent = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = (0..num_clients)
        .map(|client_id| {
            let url = url.clone();
            let delivered = Arc::clone(&delivered);
            let sent = Arc::clone(&sent);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                if let Err(e) = run_client(client_id, &url, delivered, sent, barrier).await {
                    eprintln!("client {} error: {}", client_id, e);
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("All {} clients connected, warming up", num_clients);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    sent.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed().as_secs_f64();

    let delivered = delivered.load(Ordering::SeqCst);
    let sent = sent.load(Ordering::SeqCst);

    println!();
    println!("Results over {:.2}s", elapsed);
    println!("  sent:       {:>12} ({:.0} msg/s)", sent, sent as f64 / elapsed);
    println!(
        "  delivered:  {:>12} ({:.0} msg/s)",
        delivered,
        delivered as f64 / elapsed
    );
    println!(
        "  per client: {:>12.0} msg/s",
        delivered as f64 / elapsed / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    delivered: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // Every client must be registered before anyone sends.
    barrier.wait().await;

    let message = ChatMessage::new(format!("bench-{client_id}"), "x".repeat(64));
    let frame = Message::Binary(codec::encode(&message)?.to_vec());

    let recv_task = tokio::spawn(async move {
        let mut buffer = BytesMut::with_capacity(65536);
        while let Some(Ok(frame)) = receiver.next().await {
            match frame {
                Message::Binary(data) => {
                    buffer.extend_from_slice(&data);
                    while let Ok(Some(_)) = codec::decode_from(&mut buffer) {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Message::Text(text) => {
                    if codec::decode_json(&text).is_ok() {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
                _ => {}
            }
        }
    });

    while sender.send(frame.clone()).await.is_ok() {
        sent.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
