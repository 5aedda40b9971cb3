//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding overlay messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message is malformed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The message exceeds size limits.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// The actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// The frame does not start with the expected magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// The kind discriminant is not one we know.
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    /// The codec could not build a control message.
    #[error("cannot build {0} message")]
    Control(&'static str),

    /// I/O failure on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
