//! Fuzz target for session buffering across arbitrary chunk boundaries
//!
//! # Strategy
//!
//! - Arbitrary payload bytes delivered to a live session machine in
//!   arbitrary-sized chunks, exercising every split point of the
//!   accumulate-classify-decode loop
//! - Handshake resolved mid-stream to cover the two-phase seam
//!
//! # Invariants
//!
//! - The session machine never panics regardless of chunking
//! - A closing session stops producing actions
//! - Every batch action is preceded by its ack write in the same run

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use fleetlink_core::{DeviceSession, HandshakeVerdict, SessionAction, SessionState};

#[derive(Debug, Arbitrary)]
struct Input {
    accept: bool,
    payload: Vec<u8>,
    chunk_sizes: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut session = DeviceSession::new(64 * 1024);

    // Identity frame first, delivered whole
    let mut wire = vec![0x00, 0x0F];
    wire.extend_from_slice(b"353691844288760");
    let actions = session.on_bytes(&wire);
    assert!(matches!(&actions[..], [SessionAction::Authenticate { .. }]));

    let verdict = if input.accept {
        HandshakeVerdict::Accept
    } else {
        HandshakeVerdict::Reject(fleetlink_core::CloseReason::HandshakeRejected)
    };
    let _ = session.resolve_handshake(verdict);

    // Feed the payload in arbitrary chunks
    let mut offset = 0;
    let mut sizes = input.chunk_sizes.iter().copied().map(|s| s as usize % 64 + 1);
    while offset < input.payload.len() {
        let size = sizes.next().unwrap_or(7).min(input.payload.len() - offset);
        let actions = session.on_bytes(&input.payload[offset..offset + size]);
        offset += size;

        if matches!(session.state(), SessionState::Closing | SessionState::Terminated) {
            // Everything after a close verdict must be silence
            assert!(
                session.on_bytes(&[0u8; 16]).is_empty(),
                "closing session produced actions"
            );
            break;
        }

        // A batch is always announced behind its 4-byte ack write
        for pair in actions.windows(2) {
            if matches!(pair[1], SessionAction::Batch { .. }) {
                assert!(matches!(&pair[0], SessionAction::Write(b) if b.len() == 4));
            }
        }
    }
});
