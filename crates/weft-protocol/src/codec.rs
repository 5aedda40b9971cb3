//! Message codecs.
//!
//! The overlay never looks at bytes itself: every session reads and writes
//! through a [`MessageCodec`]. Applications may plug their own; [`WireCodec`]
//! is the reference framing.

use crate::messages::{Envelope, Probe};
use crate::{Message, MessageId, MessageKind, ProtocolError, Result, MAGIC, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Length of the frame header: magic, kind, body length.
pub const HEADER_LEN: usize = 9;

const GOSSIP_FLAG: u8 = 0b0000_0001;

/// Serializes and classifies overlay messages.
pub trait MessageCodec: Send + Sync + fmt::Debug + 'static {
    /// Decodes one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered bytes can never form a valid message.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>>;

    /// Appends the encoding of `message` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be represented on the wire.
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()>;

    /// Checks that `message` can be encoded, without encoding it.
    ///
    /// # Errors
    ///
    /// Returns the error [`MessageCodec::encode`] would return.
    fn validate(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    /// Builds the keep-alive probe sent to `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec cannot produce a probe.
    fn build_ping(&self, peer: &str) -> Result<Message>;

    /// Builds the answer to `ping`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ping` is not a probe this codec can answer.
    fn build_pong(&self, ping: &Message) -> Result<Message>;

    /// Returns true if `message` is a keep-alive probe.
    fn is_ping(&self, message: &Message) -> bool {
        matches!(message, Message::Ping(_))
    }

    /// Returns true if `message` answers a probe.
    fn is_pong(&self, message: &Message) -> bool {
        matches!(message, Message::Pong(_))
    }
}

/// Reference length-prefixed framing.
///
/// ```text
/// magic "WEFT" (4) | kind (1) | body length u32 BE (4) | body
/// body = id (16) | nonce u64 BE                       (ping, pong)
/// body = id (16) | topic (1) | flags (1) | payload    (application)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec {
    max_message_size: usize,
}

impl WireCodec {
    /// Creates a codec enforcing [`MAX_MESSAGE_SIZE`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Creates a codec with a custom body size limit.
    #[must_use]
    pub const fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    fn limit(&self) -> usize {
        if self.max_message_size == 0 {
            MAX_MESSAGE_SIZE
        } else {
            self.max_message_size
        }
    }

    fn body_len(&self, message: &Message) -> Result<usize> {
        let body_len = match message {
            Message::Ping(_) | Message::Pong(_) => MessageId::LEN + 8,
            Message::Application(e) => MessageId::LEN + 2 + e.payload().len(),
        };
        if body_len > self.limit() {
            return Err(ProtocolError::TooLarge {
                size: body_len,
                max: self.limit(),
            });
        }
        Ok(body_len)
    }

    fn decode_body(kind: MessageKind, mut body: Bytes) -> Result<Message> {
        if body.remaining() < MessageId::LEN {
            return Err(ProtocolError::Malformed("truncated message id".into()));
        }
        let mut id = [0u8; MessageId::LEN];
        body.copy_to_slice(&mut id);
        let id = MessageId::from_bytes(id);

        match kind {
            MessageKind::Ping | MessageKind::Pong => {
                if body.remaining() != 8 {
                    return Err(ProtocolError::Malformed(format!(
                        "{kind} body must carry an 8 byte nonce, got {}",
                        body.remaining()
                    )));
                }
                let probe = Probe::from_parts(id, body.get_u64());
                Ok(if kind == MessageKind::Ping {
                    Message::Ping(probe)
                } else {
                    Message::Pong(probe)
                })
            }
            MessageKind::Application => {
                if body.remaining() < 2 {
                    return Err(ProtocolError::Malformed("truncated application header".into()));
                }
                let topic = body.get_u8();
                let flags = body.get_u8();
                if flags & !GOSSIP_FLAG != 0 {
                    return Err(ProtocolError::Malformed(format!("unknown flags: {flags:#010b}")));
                }
                Ok(Message::Application(Envelope::from_parts(
                    id,
                    topic,
                    flags & GOSSIP_FLAG != 0,
                    body,
                )))
            }
        }
    }
}

impl MessageCodec for WireCodec {
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        let kind_byte = src[4];
        let kind = MessageKind::from_byte(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;

        let len = (&src[5..HEADER_LEN]).get_u32() as usize;
        if len > self.limit() {
            return Err(ProtocolError::TooLarge {
                size: len,
                max: self.limit(),
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        Self::decode_body(kind, body).map(Some)
    }

    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let body_len = self.body_len(message)?;

        dst.reserve(HEADER_LEN + body_len);
        dst.put_slice(&MAGIC);
        dst.put_u8(message.kind() as u8);
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(body_len as u32);
        dst.put_slice(message.id().as_bytes());

        match message {
            Message::Ping(p) | Message::Pong(p) => dst.put_u64(p.nonce()),
            Message::Application(e) => {
                dst.put_u8(e.topic());
                dst.put_u8(if e.is_gossip() { GOSSIP_FLAG } else { 0 });
                dst.put_slice(e.payload());
            }
        }
        Ok(())
    }

    fn validate(&self, message: &Message) -> Result<()> {
        self.body_len(message).map(|_| ())
    }

    fn build_ping(&self, _peer: &str) -> Result<Message> {
        Ok(Message::ping(rand::random()))
    }

    fn build_pong(&self, ping: &Message) -> Result<Message> {
        match ping {
            Message::Ping(p) => Ok(Message::pong(p.nonce())),
            Message::Pong(_) | Message::Application(_) => Err(ProtocolError::Control("pong")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: &Message) -> Message {
        let codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn ping_roundtrip() {
        let ping = Message::ping(42);
        assert_eq!(roundtrip(&ping), ping);
    }

    #[test]
    fn pong_roundtrip() {
        let pong = Message::pong(u64::MAX);
        assert_eq!(roundtrip(&pong), pong);
    }

    #[test]
    fn application_roundtrip_keeps_identity_and_flag() {
        let msg = Message::gossip(9, "hello overlay");
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.id(), msg.id());
        assert!(decoded.is_gossip());
        let env = decoded.as_application().unwrap();
        assert_eq!(env.topic(), 9);
        assert_eq!(env.payload().as_ref(), b"hello overlay");

        let direct = Message::direct(3, Bytes::new());
        assert_eq!(roundtrip(&direct), direct);
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let codec = WireCodec::new();
        let bytes = Message::gossip(1, vec![7u8; 64]).to_bytes().unwrap();

        let mut buf = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[5..40]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[40..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn back_to_back_frames() {
        let codec = WireCodec::new();
        let first = Message::ping(1);
        let second = Message::direct(2, "two");
        let mut buf = BytesMut::new();
        codec.encode(&first, &mut buf).unwrap();
        codec.encode(&second, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn invalid_magic() {
        let mut buf = BytesMut::from(&b"BAAD\x01\x00\x00\x00\x18"[..]);
        let result = WireCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic)));
    }

    #[test]
    fn unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(0x55);
        buf.put_u32(0);
        let result = WireCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownKind(0x55))));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let codec = WireCodec::with_max_message_size(32);

        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(MessageKind::Application as u8);
        buf.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::TooLarge { size: 1024, max: 32 })
        ));

        let big = Message::direct(1, vec![0u8; 64]);
        let mut out = BytesMut::new();
        assert!(codec.encode(&big, &mut out).is_err());
        assert!(out.is_empty());
        assert!(matches!(codec.validate(&big), Err(ProtocolError::TooLarge { .. })));
        assert!(codec.validate(&Message::direct(1, vec![0u8; 8])).is_ok());
        assert!(codec.validate(&Message::ping(1)).is_ok());
    }

    #[test]
    fn probe_with_bad_length_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(MessageKind::Ping as u8);
        buf.put_u32(MessageId::LEN as u32 + 3);
        buf.put_slice(&[0u8; MessageId::LEN + 3]);
        assert!(matches!(
            WireCodec::new().decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn pong_echoes_ping_nonce() {
        let codec = WireCodec::new();
        let ping = codec.build_ping("peer-a").unwrap();
        let pong = codec.build_pong(&ping).unwrap();
        assert!(codec.is_ping(&ping));
        assert!(codec.is_pong(&pong));
        assert!(!codec.is_ping(&pong));

        let (Message::Ping(p), Message::Pong(q)) = (&ping, &pong) else {
            panic!("wrong message kinds");
        };
        assert_eq!(p.nonce(), q.nonce());
        assert_ne!(ping.id(), pong.id());

        assert!(codec.build_pong(&Message::direct(1, "x")).is_err());
    }
}
