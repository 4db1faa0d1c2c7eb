//! End-to-end throughput benchmark for Parley.
//!
//! Clients are paired up and message their partner over real WebSockets.
//! Each client waits for the server's `message_sent` confirmation before
//! sending again, so the outbound queues never overflow.
//!
//! ```bash
//! PARLEY_JWT_SECRET=bench parley &
//! PARLEY_JWT_SECRET=bench e2e_throughput 32
//! ```

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use parley_core::{JwtVerifier, UserId};
use parley_protocol::{codec, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    confirmed: AtomicU64,
    confirm_micros: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.delivered.store(0, Ordering::SeqCst);
        self.confirmed.store(0, Ordering::SeqCst);
        self.confirm_micros.store(0, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args
        .get(1)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(16)
        .max(2)
        & !1;

    let Ok(secret) = std::env::var("PARLEY_JWT_SECRET") else {
        eprintln!("PARLEY_JWT_SECRET must match the server's secret");
        std::process::exit(1);
    };
    let url = std::env::var("PARLEY_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        Parley End-to-End Throughput Benchmark                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_chat_benchmark(num_clients, &url, JwtVerifier::new(secret.as_bytes())).await;
}

async fn run_chat_benchmark(num_clients: usize, url: &str, verifier: JwtVerifier) {
    println!("📊 Direct-message benchmark: {} clients ({} pairs)", num_clients, num_clients / 2);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let user = format!("bench-{client_id}");
        let partner = format!("bench-{}", client_id ^ 1);
        let token = match verifier.issue(&UserId::new(user.as_str()), Duration::from_secs(3600)) {
            Ok(token) => token,
            Err(e) => {
                eprintln!("Failed to issue token: {e}");
                return;
            }
        };
        let url = format!("{url}?token={token}");
        let counters = Arc::clone(&counters);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&url, &partner, counters, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("✓ All {} clients connected", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    counters.reset();
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let delivered = counters.delivered.load(Ordering::SeqCst);
    let confirmed = counters.confirmed.load(Ordering::SeqCst);
    let micros = counters.confirm_micros.load(Ordering::SeqCst);

    let msgs_per_sec = delivered as f64 / elapsed.as_secs_f64();
    let avg_confirm_ms = if confirmed > 0 {
        micros as f64 / confirmed as f64 / 1000.0
    } else {
        0.0
    };

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
        "║  Delivered:            {:>10}                           ║",
        delivered
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Avg confirmation:     {:>10.3} ms                       ║",
        avg_confirm_ms
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    url: &str,
    partner: &str,
    counters: Arc<Counters>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (mut ws, _) = connect_async(url).await?;
    let mut recv_buf = BytesMut::with_capacity(65536);

    // Wait for the online snapshot that follows `connected`
    loop {
        match next_frame(&mut ws, &mut recv_buf).await? {
            Some(Frame::OnlineUsers { .. }) => break,
            Some(_) => continue,
            None => return Err("connection closed during handshake".into()),
        }
    }

    barrier.wait().await;

    let send_msg = Message::Binary(codec::encode(&Frame::send_message(partner, "x".repeat(64)))?.to_vec());

    loop {
        let sent_at = Instant::now();
        ws.send(send_msg.clone()).await?;

        // Count everything that arrives until our confirmation comes back
        loop {
            match next_frame(&mut ws, &mut recv_buf).await? {
                Some(Frame::ReceiveMessage { .. }) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Some(Frame::MessageSent { .. }) => {
                    counters.confirmed.fetch_add(1, Ordering::Relaxed);
                    counters
                        .confirm_micros
                        .fetch_add(sent_at.elapsed().as_micros() as u64, Ordering::Relaxed);
                    break;
                }
                Some(Frame::Error { code, message }) => {
                    return Err(format!("server closed us ({code}): {message}").into());
                }
                Some(_) => {}
                None => return Ok(()),
            }
        }
    }
}

/// Read the next complete frame, buffering partial binary messages.
async fn next_frame<S>(ws: &mut S, buf: &mut BytesMut) -> Result<Option<Frame>, BoxError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        if let Some(frame) = codec::decode_from(buf)? {
            return Ok(Some(frame));
        }
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
