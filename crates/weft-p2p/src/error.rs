//! P2P error types.

use crate::PeerId;
use thiserror::Error;

/// Errors reported by the transport substrate.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening a stream to the peer failed.
    #[error("connection to {peer} failed: {reason}")]
    Connect {
        /// The peer we tried to reach.
        peer: PeerId,
        /// Substrate-provided reason.
        reason: String,
    },

    /// The peer is not reachable through this substrate.
    #[error("peer unreachable: {0}")]
    Unreachable(PeerId),

    /// The stream failed after it was established.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// The local host identity is not available.
    #[error("local host is not available: {0}")]
    NoHost(String),
}

/// Errors that can occur during overlay operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Transport failure (dial, read or write).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A peer sent bytes the codec could not decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] weft_protocol::ProtocolError),

    /// Keep-alive expired without a pong.
    #[error("keep-alive timeout for peer {0}")]
    Timeout(PeerId),

    /// Dialing was skipped because the connection cap is reached.
    #[error("connection cap reached: {max}")]
    AdmissionRejected {
        /// The configured cap.
        max: usize,
    },

    /// A targeted request was dropped after the retry bound.
    #[error("delivery to {peer} abandoned after {attempts} attempts")]
    RetryExhausted {
        /// The unreachable target.
        peer: PeerId,
        /// How many dispatch attempts were made.
        attempts: u32,
    },

    /// The overlay was built without a message observer.
    #[error("no message observer configured")]
    NoObserverConfigured,

    /// A session's outbound queue stayed full past the send timeout.
    #[error("outbound queue for {peer} is full")]
    Backpressure {
        /// The slow peer.
        peer: PeerId,
    },

    /// The session has already stopped.
    #[error("session for {0} is closed")]
    SessionClosed(PeerId),

    /// An empty or otherwise unusable peer ID.
    #[error("invalid peer id: {0:?}")]
    InvalidPeerId(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The overlay is shutting down.
    #[error("overlay shutting down")]
    Shutdown,
}

impl From<config::ConfigError> for P2pError {
    fn from(err: config::ConfigError) -> Self {
        P2pError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for P2pError {
    fn from(err: validator::ValidationErrors) -> Self {
        P2pError::Config(err.to_string())
    }
}

/// A specialized Result type for P2P operations.
pub type Result<T> = std::result::Result<T, P2pError>;
