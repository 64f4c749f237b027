//! Error types for the async layer.
//!
//! [`TetherError`] extends [`tether_core::ArqError`] with I/O, timeout,
//! configuration, and connection variants needed by the runtime layer.

use std::fmt;
use tether_core::DisconnectReason;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

// ── Error types ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    #[error("Send backlog full, retry after in-flight data drains")]
    Backpressure,

    #[error("Message too large: {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    Closed,
    Refused,
    Lost,
    HandshakeFailed,
    IdleTimeout,
    NotConnected,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Refused => write!(f, "connection refused"),
            Self::Lost => write!(f, "connection lost"),
            Self::HandshakeFailed => write!(f, "handshake failed"),
            Self::IdleTimeout => write!(f, "connection idle timeout"),
            Self::NotConnected => write!(f, "not connected"),
        }
    }
}

// ── Bridges: core errors and lifecycle reasons ──────────────────────────

impl From<tether_core::ArqError> for TetherError {
    fn from(e: tether_core::ArqError) -> Self {
        match e {
            tether_core::ArqError::Malformed { message } => Self::Protocol { message },
            tether_core::ArqError::MessageTooLarge { size, max } => {
                Self::MessageTooLarge { size, max }
            }
            tether_core::ArqError::WouldBlock => Self::Backpressure,
            tether_core::ArqError::ConnectionLost => Self::Connection {
                kind: ConnectionError::Lost,
            },
        }
    }
}

impl From<DisconnectReason> for ConnectionError {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::PeerClosed | DisconnectReason::LocalClosed => Self::Closed,
            DisconnectReason::IdleTimeout => Self::IdleTimeout,
            DisconnectReason::HandshakeTimeout => Self::HandshakeFailed,
            DisconnectReason::Refused => Self::Refused,
            DisconnectReason::Lost => Self::Lost,
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl TetherError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn connection(kind: ConnectionError) -> Self {
        Self::Connection { kind }
    }

    pub fn disconnected(reason: DisconnectReason) -> Self {
        Self::Connection {
            kind: reason.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

impl TetherError {
    /// Retry after in-flight data drains; nothing is broken.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure)
    }

    /// Transient conditions that clear on their own; worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backpressure | Self::Timeout { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                kind: ConnectionError::Lost | ConnectionError::Closed
            } | Self::Internal { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Connection { kind } => matches!(
                kind,
                ConnectionError::Closed | ConnectionError::Refused | ConnectionError::Lost
            ),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
