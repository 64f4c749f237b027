//! # Tether: reliable UDP transport for game traffic
//!
//! An async-first ARQ transport built on Tokio: reliable, ordered messages
//! with configurable latency/bandwidth trade-offs, plus an unreliable
//! datagram channel sharing the same conversation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  tether  (this crate)                       │
//! │                                             │
//! │  TetherStream / TetherListener  ← user API  │
//! │  actor                          ← scheduler │
//! │  transport                      ← UDP I/O   │
//! ├─────────────────────────────────────────────┤
//! │  tether-core  (dependency)                  │
//! │                                             │
//! │  ArqEngine   ← pure sync state machine      │
//! │  Peer        ← connection lifecycle         │
//! │  protocol    ← wire types & constants       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::{TetherConfig, TetherStream};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addr: SocketAddr = "127.0.0.1:8080".parse()?;
//!     let config = TetherConfig::new().fast_mode();
//!     let mut stream = TetherStream::connect(addr, config).await?;
//!
//!     stream.send(b"hello").await?;
//!     if let Some(reply) = stream.recv().await {
//!         println!("got {} bytes back", reply.len());
//!     }
//!
//!     stream.disconnect().await;
//!     Ok(())
//! }
//! ```

// ── Layer 1: Core protocol (re-exported from tether-core) ───────────────

/// Core protocol types, constants, and wire format.
pub use tether_core::protocol;

/// Direct access to the standalone `tether-core` crate.
pub use tether_core;

pub use tether_core::{ArqStats, ConnectionState, DelayConfig, DisconnectReason};

// ── Layer 2: Transport & runtime infrastructure ─────────────────────────

pub mod buffer_pool;
pub mod transport;
pub use transport::{Addr, Transport, UdpTransport};

// ── Layer 3: Configuration & errors (extends core with I/O concerns) ────

pub mod config;
pub mod error;
pub use config::TetherConfig;
pub use error::{Result, TetherError};

// ── Layer 4: Async transport (actor + stream + listener) ────────────────

pub(crate) mod actor;
pub mod listener;
pub mod stream;

pub use listener::TetherListener;
pub use stream::TetherStream;

pub mod metrics;

// ── Version info ────────────────────────────────────────────────────────

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
