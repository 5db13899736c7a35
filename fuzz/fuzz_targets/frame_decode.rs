//! Fuzz target for the wire-format decoders
//!
//! # Strategy
//!
//! - Raw bytes: arbitrary sequences through classify and every decoder
//! - Mutated frames: valid envelopes with corrupted lengths, counts, CRCs
//!
//! # Invariants
//!
//! - No decoder ever panics on any input
//! - `classify` never consumes bytes and agrees with the decoders:
//!   a buffer classified `NeedMoreBytes` never decodes to `Complete`
//! - Declared lengths never cause allocation before validation

#![no_main]

use libfuzzer_sys::fuzz_target;

use fleetlink_proto::{
    classify, decode_avl, decode_codec12_response, decode_handshake, Decoded, FrameKind,
};

fuzz_target!(|data: &[u8]| {
    let kind = classify(data);

    let handshake = decode_handshake(data);
    let avl = decode_avl(data);
    let response = decode_codec12_response(data);

    if kind == FrameKind::NeedMoreBytes {
        // An incomplete buffer never yields a complete frame
        assert!(!matches!(handshake, Ok(Decoded::Complete(_))));
        assert!(!matches!(avl, Ok(Decoded::Complete(_))));
        assert!(!matches!(response, Ok(Decoded::Complete(_))));
    }

    if let Ok(Decoded::Complete(frame)) = handshake {
        assert!(frame.consumed <= data.len());
        assert!(frame.imei.bytes().all(|b| b.is_ascii_digit()));
    }
    if let Ok(Decoded::Complete(batch)) = avl {
        assert!(batch.consumed <= data.len());
    }
    if let Ok(Decoded::Complete(resp)) = response {
        assert!(resp.consumed <= data.len());
    }
});
