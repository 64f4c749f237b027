//! Echo server over the reliable and unreliable channels.
//!
//! Run with: cargo run --example echo_server [address]
//! Then point echo_client at the same address.

use std::net::SocketAddr;
use std::time::Duration;
use tether::{TetherConfig, TetherListener, TetherStream};
use tokio::time::timeout;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4000".to_string())
        .parse()?;

    let config = TetherConfig::gaming().max_connections(256);
    let mut listener = TetherListener::bind(addr, config).await?;
    info!("echo server listening on {}", listener.local_addr());

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!(
                    "accepted {} (conv {:#010x}, {} active)",
                    peer_addr,
                    stream.conv(),
                    listener.active_connections()
                );
                tokio::spawn(async move {
                    if let Err(e) = serve(stream).await {
                        error!("connection {} failed: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Echo every reliable message, then answer the datagram ping that the
/// client sends after each one. A lost ping is simply skipped.
async fn serve(mut stream: TetherStream) -> tether::Result<()> {
    while let Some(msg) = stream.recv().await {
        info!("echoing {} bytes", msg.len());
        stream.send(&msg).await?;

        match timeout(Duration::from_millis(250), stream.recv_unreliable()).await {
            Ok(Some(ping)) => stream.send_unreliable(&ping).await?,
            Ok(None) => break,
            Err(_) => {}
        }
    }

    info!(
        "peer {} gone: {:?}",
        stream.peer_addr(),
        stream.disconnect_reason()
    );
    Ok(())
}
