//! Fuzz target for wire message decoding.
//!
//! Tests that the frame decoder handles arbitrary input without panicking
//! and that every frame it accepts re-encodes to an equal message.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use weft_protocol::{MessageCodec, WireCodec};

fuzz_target!(|data: &[u8]| {
    let codec = WireCodec::new();
    let mut buf = BytesMut::from(data);

    while let Ok(Some(message)) = codec.decode(&mut buf) {
        let mut encoded = BytesMut::new();
        codec
            .encode(&message, &mut encoded)
            .expect("decoded message must re-encode");
        let again = codec.decode(&mut encoded).expect("re-encoded frame must decode");
        assert_eq!(again, Some(message));
    }
});
