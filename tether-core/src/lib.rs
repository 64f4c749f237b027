//! Pure synchronous ARQ transport core.
//!
//! This crate implements the reliable-UDP protocol machinery with no
//! runtime, no sockets, and no async. Its only dependencies are `bytes`
//! and `tracing`.
//!
//! ```text
//! ┌────────────────────────────────┐
//! │  tether-core                   │
//! │                                │
//! │  protocol  ← wire format       │
//! │  window    ← send/recv windows │
//! │  engine    ← ARQ state machine │
//! │  peer      ← connection states │
//! │  config    ← tuning            │
//! │  error     ← 4 variants        │
//! └────────────────────────────────┘
//! ```
//!
//! The caller owns the socket and the clock. Feed incoming datagrams to
//! [`Peer::input`], call [`Peer::tick`] on a timer, and ship whatever
//! [`Peer::drain_output`] returns.

pub mod config;
pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod window;

pub use config::{ArqConfig, DelayConfig};
pub use engine::{ArqEngine, ArqStats};
pub use error::{ArqError, ArqResult};
pub use peer::{Channel, ConnectionState, DisconnectReason, Peer, PeerEvent, Side};
pub use protocol::*;
