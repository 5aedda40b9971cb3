//! Property tests for the reference wire codec.

use bytes::BytesMut;
use proptest::prelude::*;
use weft_protocol::{Message, MessageCodec, WireCodec, HEADER_LEN};

proptest! {
    #[test]
    fn application_messages_survive_the_wire(
        topic in any::<u8>(),
        gossip in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let codec = WireCodec::new();
        let msg = Message::application(topic, gossip, payload.clone());

        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        prop_assert_eq!(decoded.id(), msg.id());
        prop_assert_eq!(decoded.kind(), msg.kind());
        prop_assert_eq!(decoded.is_gossip(), gossip);
        let env = decoded.as_application().unwrap();
        prop_assert_eq!(env.topic(), topic);
        prop_assert_eq!(env.payload().as_ref(), payload.as_slice());
    }

    #[test]
    fn decoder_never_panics_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut buf = BytesMut::from(data.as_slice());
        let _ = WireCodec::new().decode(&mut buf);
    }

    #[test]
    fn split_delivery_decodes_once(nonce in any::<u64>(), cut in 0usize..(HEADER_LEN + 24)) {
        let codec = WireCodec::new();
        let ping = Message::ping(nonce);
        let bytes = ping.to_bytes().unwrap();
        let cut = cut.min(bytes.len());

        let mut buf = BytesMut::from(&bytes[..cut]);
        let early = codec.decode(&mut buf).unwrap();
        if cut < bytes.len() {
            prop_assert!(early.is_none());
            buf.extend_from_slice(&bytes[cut..]);
            prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(ping));
        } else {
            prop_assert_eq!(early, Some(ping));
        }
    }
}
