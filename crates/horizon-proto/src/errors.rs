//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire data.
///
/// None of these are fatal to a connection on their own. The session layer
/// answers malformed envelopes with an `error` envelope and keeps reading;
/// only framing errors (oversized or truncated frames) end a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Bytes were not a JSON object
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Serialization failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// Declared frame length exceeds [`crate::MAX_FRAME_SIZE`]
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared size
        size: usize,
        /// Maximum accepted size
        max: usize,
    },

    /// Buffer ended before the declared frame length
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the length prefix promised
        expected: usize,
        /// Bytes available
        actual: usize,
    },
}
