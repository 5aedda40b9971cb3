//! # Weft Protocol
//!
//! Message model and wire codecs for the Weft peer overlay.
//!
//! Messages form a closed set: keep-alive [`Message::Ping`] and
//! [`Message::Pong`], and [`Message::Application`] envelopes that carry an
//! opaque payload, an application topic, a gossip flag and a stable
//! [`MessageId`] used for flood deduplication.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;

pub use codec::{MessageCodec, WireCodec, HEADER_LEN};
pub use error::{ProtocolError, Result};
pub use messages::{Envelope, Message, MessageId, MessageKind, Probe};

/// Magic bytes identifying Weft frames.
pub const MAGIC: [u8; 4] = *b"WEFT";

/// Maximum message body size in bytes (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
