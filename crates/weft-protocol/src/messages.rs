//! Overlay message definitions.

use crate::{MessageCodec, Result, WireCodec};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a message instance, used for gossip deduplication.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// The length of a `MessageId` in bytes.
    pub const LEN: usize = 16;

    /// Generates a fresh random identity.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Creates an identity from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The kind of message, as carried in the one-byte wire discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Keep-alive probe.
    Ping = 0x01,
    /// Keep-alive answer.
    Pong = 0x02,
    /// Application payload.
    Application = 0x03,
}

impl MessageKind {
    /// Parses a kind from its wire byte.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Pong),
            0x03 => Some(Self::Application),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => write!(f, "ping"),
            Self::Pong => write!(f, "pong"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Body of a ping or pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    id: MessageId,
    nonce: u64,
}

impl Probe {
    pub(crate) const fn from_parts(id: MessageId, nonce: u64) -> Self {
        Self { id, nonce }
    }

    /// The probe nonce. A pong echoes the nonce of the ping it answers.
    #[must_use]
    pub const fn nonce(&self) -> u64 {
        self.nonce
    }
}

/// An application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: MessageId,
    topic: u8,
    gossip: bool,
    payload: Bytes,
}

impl Envelope {
    pub(crate) fn from_parts(id: MessageId, topic: u8, gossip: bool, payload: Bytes) -> Self {
        Self {
            id,
            topic,
            gossip,
            payload,
        }
    }

    /// Application-defined topic byte.
    #[must_use]
    pub const fn topic(&self) -> u8 {
        self.topic
    }

    /// Whether the overlay should flood this message to other peers.
    #[must_use]
    pub const fn is_gossip(&self) -> bool {
        self.gossip
    }

    /// The opaque payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// A message exchanged between overlay peers.
///
/// Identity is assigned when the value is built and never changes, so
/// encoding a message is free of side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive probe.
    Ping(Probe),
    /// Keep-alive answer.
    Pong(Probe),
    /// Application payload.
    Application(Envelope),
}

impl Message {
    /// Creates a ping carrying `nonce`.
    #[must_use]
    pub fn ping(nonce: u64) -> Self {
        Self::Ping(Probe::from_parts(MessageId::random(), nonce))
    }

    /// Creates the pong answering a ping with `nonce`.
    #[must_use]
    pub fn pong(nonce: u64) -> Self {
        Self::Pong(Probe::from_parts(MessageId::random(), nonce))
    }

    /// Creates a point-to-point application message.
    #[must_use]
    pub fn direct(topic: u8, payload: impl Into<Bytes>) -> Self {
        Self::application(topic, false, payload)
    }

    /// Creates an application message that floods across the overlay.
    #[must_use]
    pub fn gossip(topic: u8, payload: impl Into<Bytes>) -> Self {
        Self::application(topic, true, payload)
    }

    /// Creates an application message with an explicit gossip flag.
    #[must_use]
    pub fn application(topic: u8, gossip: bool, payload: impl Into<Bytes>) -> Self {
        Self::Application(Envelope::from_parts(
            MessageId::random(),
            topic,
            gossip,
            payload.into(),
        ))
    }

    /// The wire discriminant of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
            Self::Application(_) => MessageKind::Application,
        }
    }

    /// The stable identity of this message.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        match self {
            Self::Ping(p) | Self::Pong(p) => p.id,
            Self::Application(e) => e.id,
        }
    }

    /// Whether this message should be re-broadcast by receivers.
    /// Control messages never gossip.
    #[must_use]
    pub const fn is_gossip(&self) -> bool {
        match self {
            Self::Application(e) => e.gossip,
            Self::Ping(_) | Self::Pong(_) => false,
        }
    }

    /// Returns true for ping and pong.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_))
    }

    /// Returns the application envelope, if any.
    #[must_use]
    pub fn as_application(&self) -> Option<&Envelope> {
        match self {
            Self::Application(e) => Some(e),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }

    /// Serializes the message with the reference wire format.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the wire size limit.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        WireCodec::new().encode(self, &mut buf)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_unique() {
        let a = Message::gossip(1, "hello");
        let b = Message::gossip(1, "hello");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn control_messages_never_gossip() {
        assert!(!Message::ping(7).is_gossip());
        assert!(!Message::pong(7).is_gossip());
        assert!(Message::ping(7).is_control());
        assert!(Message::gossip(1, "x").is_gossip());
        assert!(!Message::direct(1, "x").is_gossip());
    }

    #[test]
    fn kind_bytes() {
        assert_eq!(MessageKind::from_byte(0x01), Some(MessageKind::Ping));
        assert_eq!(MessageKind::from_byte(0x03), Some(MessageKind::Application));
        assert_eq!(MessageKind::from_byte(0x7f), None);
        assert_eq!(Message::pong(1).kind(), MessageKind::Pong);
    }
}
