//! Error types for the ARQ protocol engine

use std::fmt;

/// Result type for core protocol operations
pub type ArqResult<T> = std::result::Result<T, ArqError>;

/// Error types produced by the protocol engine.
#[derive(Debug)]
pub enum ArqError {
    /// Datagram or segment failed validation (truncated, bad command,
    /// length field past the end of the buffer)
    Malformed { message: String },
    /// Message exceeds what the fragmenter can carry in one logical message
    MessageTooLarge { size: usize, max: usize },
    /// Send backlog is full; retry after acks drain the window
    WouldBlock,
    /// Retry budget exhausted on a segment, or peer went silent past the
    /// idle timeout
    ConnectionLost,
}

impl ArqError {
    /// Create a malformed-segment error
    pub fn malformed(message: impl Into<String>) -> Self {
        ArqError::Malformed {
            message: message.into(),
        }
    }

    /// Fatal errors tear the connection down; everything else is retryable
    /// or absorbable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ArqError::ConnectionLost)
    }

    /// Backpressure is the one error callers are expected to retry on.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, ArqError::WouldBlock)
    }
}

impl fmt::Display for ArqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArqError::Malformed { message } => write!(f, "Malformed segment: {message}"),
            ArqError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {size} bytes exceeds limit of {max}")
            }
            ArqError::WouldBlock => write!(f, "Send backlog full, retry after acks drain"),
            ArqError::ConnectionLost => write!(f, "Connection lost"),
        }
    }
}

impl std::error::Error for ArqError {}
