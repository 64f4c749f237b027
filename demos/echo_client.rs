//! Echo client: reliable round-trips plus fire-and-forget datagram pings.
//!
//! Run with: cargo run --example echo_client [address]

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tether::{TetherConfig, TetherStream};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4000".to_string())
        .parse()?;

    let config = TetherConfig::gaming();
    let mut stream = TetherStream::connect(addr, config).await?;
    info!(
        "connected to {} (conv {:#010x}, max message {} bytes)",
        stream.peer_addr(),
        stream.conv(),
        stream.max_message()
    );

    for i in 0..5 {
        let msg = format!("hello tether {i}");
        let started = Instant::now();
        stream.send(msg.as_bytes()).await?;

        let Some(echo) = stream.recv().await else {
            error!("server closed mid-exchange: {:?}", stream.disconnect_reason());
            return Ok(());
        };
        if echo == msg.as_bytes() {
            info!("echo {:?} in {:?}", msg, started.elapsed());
        } else {
            error!("echo mismatch: sent {:?}, got {} bytes", msg, echo.len());
        }

        let ping = format!("ping {i}");
        stream.send_unreliable(ping.as_bytes()).await?;
        match timeout(Duration::from_millis(250), stream.recv_unreliable()).await {
            Ok(Some(pong)) => info!("pong: {}", String::from_utf8_lossy(&pong)),
            Ok(None) => break,
            Err(_) => warn!("pong lost, carrying on"),
        }

        sleep(Duration::from_millis(200)).await;
    }

    let stats = stream.stats().await?;
    info!(
        "done: {} msgs / {} dgrams sent, {} segments, {} retransmits, srtt {} ms",
        stats.messages_sent,
        stats.dgrams_sent,
        stats.segments_sent,
        stats.retransmits,
        stats.srtt
    );

    stream.disconnect().await;
    info!("disconnected: {:?}", stream.disconnect_reason());
    Ok(())
}
