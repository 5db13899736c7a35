//! Per-connection session state machine.
//!
//! Pure logic, no I/O: the transport driver feeds inbound bytes in and
//! executes the returned actions. This keeps the whole protocol flow
//! testable with byte arrays and makes the driver a thin loop.
//!
//! # State machine
//!
//! ```text
//! ┌────────────┐ identity frame ┌────────────────┐ accept, 0x01 ┌───────────┐
//! │ Connecting │───────────────>│ Authenticating │─────────────>│ Streaming │
//! └────────────┘                └────────────────┘              └───────────┘
//!       │                              │ reject, 0x00                 │
//!       │ malformed                    ↓                              │ malformed /
//!       │                         ┌─────────┐     ┌────────────┐     │ peer close
//!       └────────────────────────>│ Closing │────>│ Terminated │<────┘
//!                                 └─────────┘     └────────────┘
//! ```
//!
//! The handshake is two-phase: decoding the identity frame surfaces an
//! [`SessionAction::Authenticate`] action, the driver consults the
//! validator, admission controller, and registry, and reports the verdict
//! back through [`DeviceSession::resolve_handshake`]. Bytes that arrive
//! while the verdict is outstanding stay buffered.

use bytes::{Bytes, BytesMut};
use fleetlink_proto::{
    AvlRecord, Decoded, FrameKind, classify, decode_avl, decode_codec12_response,
    decode_handshake,
};

use crate::event::CloseReason;

/// Handshake reply bytes on the wire.
const ACCEPT: u8 = 0x01;
const REJECT: u8 = 0x00;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted; waiting for the identity frame.
    Connecting,
    /// Identity frame decoded; verdict outstanding.
    Authenticating,
    /// Bound and streaming telemetry.
    Streaming,
    /// Failure or peer close observed; resources being released.
    Closing,
    /// Terminal.
    Terminated,
}

/// Driver verdict on a decoded identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeVerdict {
    /// Identity validated and bound; ack with 0x01 and start streaming.
    Accept,
    /// Identity refused; nack with 0x00 and close.
    Reject(CloseReason),
}

/// Actions for the transport driver to execute, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Queue these bytes on the session's serialized write path.
    Write(Bytes),

    /// An identity frame was decoded; validate it and call
    /// [`DeviceSession::resolve_handshake`] with the verdict.
    Authenticate {
        /// Identity exactly as offered by the peer.
        imei: String,
    },

    /// A telemetry batch was decoded and acked. Records are sorted by
    /// ascending timestamp, ready for the event sink.
    Batch {
        /// Records of the batch.
        records: Vec<AvlRecord>,
        /// Whether the frame's CRC matched; a mismatch is log-worthy but
        /// the records are good.
        crc_ok: bool,
    },

    /// A Codec 12 response was decoded. Hand it to the dispatcher before
    /// emitting any event.
    Response {
        /// Response text.
        text: String,
        /// Whether the frame's CRC matched.
        crc_ok: bool,
    },

    /// Stop the session. Always the last action of a batch.
    Close {
        /// Why the session is closing.
        reason: CloseReason,
    },
}

/// State machine for one device connection.
#[derive(Debug)]
pub struct DeviceSession {
    state: SessionState,
    buf: BytesMut,
    imei: Option<String>,
    max_buffer: usize,
}

impl DeviceSession {
    /// Create a session in `Connecting`, with a cap on how many unparsed
    /// bytes it will buffer before giving up on the stream.
    #[must_use]
    pub fn new(max_buffer: usize) -> Self {
        Self { state: SessionState::Connecting, buf: BytesMut::new(), imei: None, max_buffer }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity offered by the peer. Authoritative once the session is
    /// `Streaming`.
    #[must_use]
    pub fn imei(&self) -> Option<&str> {
        self.imei.as_deref()
    }

    /// Feed one inbound chunk and decode as many complete frames as the
    /// buffer now holds. The retained suffix always starts at the first
    /// unconsumed byte.
    pub fn on_bytes(&mut self, chunk: &[u8]) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if matches!(self.state, SessionState::Closing | SessionState::Terminated) {
            return actions;
        }

        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_buffer {
            self.fail(CloseReason::ProtocolError, &mut actions);
            return actions;
        }

        self.drain(&mut actions);
        actions
    }

    /// Report the handshake verdict. On accept the ack is written and any
    /// bytes the device pipelined behind its identity frame are decoded.
    pub fn resolve_handshake(&mut self, verdict: HandshakeVerdict) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if self.state != SessionState::Authenticating {
            return actions;
        }

        match verdict {
            HandshakeVerdict::Accept => {
                self.state = SessionState::Streaming;
                actions.push(SessionAction::Write(Bytes::from_static(&[ACCEPT])));
                self.drain(&mut actions);
            },
            HandshakeVerdict::Reject(reason) => {
                self.state = SessionState::Closing;
                actions.push(SessionAction::Write(Bytes::from_static(&[REJECT])));
                actions.push(SessionAction::Close { reason });
            },
        }

        actions
    }

    /// Mark the session terminated. Idempotent; later bytes are ignored.
    pub fn terminate(&mut self) {
        self.state = SessionState::Terminated;
    }

    /// Decode frames off the front of the buffer until it runs dry or the
    /// session leaves a readable state.
    fn drain(&mut self, actions: &mut Vec<SessionAction>) {
        loop {
            match self.state {
                SessionState::Connecting => match decode_handshake(&self.buf) {
                    Ok(Decoded::Complete(frame)) => {
                        let _ = self.buf.split_to(frame.consumed);
                        self.state = SessionState::Authenticating;
                        self.imei = Some(frame.imei.clone());
                        actions.push(SessionAction::Authenticate { imei: frame.imei });
                        return;
                    },
                    Ok(Decoded::Partial) => return,
                    Err(_) => {
                        self.fail(CloseReason::ProtocolError, actions);
                        return;
                    },
                },

                // Verdict outstanding; keep buffering
                SessionState::Authenticating => return,

                SessionState::Streaming => match classify(&self.buf) {
                    FrameKind::NeedMoreBytes => return,
                    FrameKind::AvlBatch => match decode_avl(&self.buf) {
                        Ok(Decoded::Complete(batch)) => {
                            let _ = self.buf.split_to(batch.consumed);

                            let count = batch.records.len() as u32;
                            actions.push(SessionAction::Write(Bytes::copy_from_slice(
                                &count.to_be_bytes(),
                            )));

                            let mut records = batch.records;
                            records.sort_by_key(|r| r.timestamp_ms);
                            actions
                                .push(SessionAction::Batch { records, crc_ok: batch.crc_ok });
                        },
                        Ok(Decoded::Partial) => return,
                        Err(_) => {
                            self.fail(CloseReason::ProtocolError, actions);
                            return;
                        },
                    },
                    FrameKind::Codec12Response => match decode_codec12_response(&self.buf) {
                        Ok(Decoded::Complete(resp)) => {
                            let _ = self.buf.split_to(resp.consumed);
                            actions.push(SessionAction::Response {
                                text: resp.text,
                                crc_ok: resp.crc_ok,
                            });
                        },
                        Ok(Decoded::Partial) => return,
                        Err(_) => {
                            self.fail(CloseReason::ProtocolError, actions);
                            return;
                        },
                    },
                    // A second identity frame mid-stream is as fatal as junk
                    FrameKind::Handshake | FrameKind::Malformed => {
                        self.fail(CloseReason::ProtocolError, actions);
                        return;
                    },
                },

                SessionState::Closing | SessionState::Terminated => return,
            }
        }
    }

    fn fail(&mut self, reason: CloseReason, actions: &mut Vec<SessionAction>) {
        self.state = SessionState::Closing;
        actions.push(SessionAction::Close { reason });
    }
}

#[cfg(test)]
mod tests {
    use fleetlink_proto::crc16;
    use proptest::prelude::*;

    use super::*;

    const MAX_BUFFER: usize = 1024 * 1024;

    fn handshake_bytes(imei: &str) -> Vec<u8> {
        let mut buf = (imei.len() as u16).to_be_bytes().to_vec();
        buf.extend_from_slice(imei.as_bytes());
        buf
    }

    fn response_bytes(text: &[u8]) -> Vec<u8> {
        let mut data = vec![0x0C, 0x01, 0x06];
        data.extend_from_slice(&(text.len() as u32).to_be_bytes());
        data.extend_from_slice(text);
        data.push(0x01);

        let mut out = vec![0, 0, 0, 0];
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&data);
        out.extend_from_slice(&u32::from(crc16(&data)).to_be_bytes());
        out
    }

    fn batch_bytes() -> Vec<u8> {
        // Two-record Codec 8 capture, timestamps 18 s apart
        hex::decode(
            "000000000000004308020000016B40D57B480100000000000000000000000000000001010101\
             000000000000016B40D5C19801000000000000000000000000000000010101010100000002000\
             0252C"
                .replace(char::is_whitespace, ""),
        )
        .unwrap()
    }

    fn streaming_session() -> DeviceSession {
        let mut session = DeviceSession::new(MAX_BUFFER);
        let actions = session.on_bytes(&handshake_bytes("353691844288760"));
        assert!(matches!(&actions[..], [SessionAction::Authenticate { .. }]));
        let actions = session.resolve_handshake(HandshakeVerdict::Accept);
        assert_eq!(actions[0], SessionAction::Write(Bytes::from_static(&[0x01])));
        assert_eq!(session.state(), SessionState::Streaming);
        session
    }

    #[test]
    fn handshake_surfaces_identity_for_validation() {
        let mut session = DeviceSession::new(MAX_BUFFER);

        let actions = session.on_bytes(&handshake_bytes("353691844288760"));
        assert_eq!(actions, vec![SessionAction::Authenticate {
            imei: "353691844288760".to_string()
        }]);
        assert_eq!(session.state(), SessionState::Authenticating);
        assert_eq!(session.imei(), Some("353691844288760"));
    }

    #[test]
    fn handshake_survives_byte_at_a_time_delivery() {
        let mut session = DeviceSession::new(MAX_BUFFER);
        let bytes = handshake_bytes("353691844288760");

        for &b in &bytes[..bytes.len() - 1] {
            assert!(session.on_bytes(&[b]).is_empty());
        }
        let actions = session.on_bytes(&bytes[bytes.len() - 1..]);
        assert!(matches!(&actions[..], [SessionAction::Authenticate { .. }]));
    }

    #[test]
    fn reject_nacks_and_closes() {
        let mut session = DeviceSession::new(MAX_BUFFER);
        session.on_bytes(&handshake_bytes("353691844288761"));

        let actions = session.resolve_handshake(HandshakeVerdict::Reject(
            CloseReason::HandshakeRejected,
        ));
        assert_eq!(actions, vec![
            SessionAction::Write(Bytes::from_static(&[0x00])),
            SessionAction::Close { reason: CloseReason::HandshakeRejected },
        ]);
        assert_eq!(session.state(), SessionState::Closing);

        // Later bytes are ignored
        assert!(session.on_bytes(&[0xFF]).is_empty());
    }

    #[test]
    fn batch_is_acked_with_record_count_then_emitted_sorted() {
        let mut session = streaming_session();

        let actions = session.on_bytes(&batch_bytes());
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[0],
            SessionAction::Write(Bytes::copy_from_slice(&[0, 0, 0, 2]))
        );
        let SessionAction::Batch { records, crc_ok } = &actions[1] else {
            panic!("expected a batch action");
        };
        assert!(*crc_ok);
        assert_eq!(records.len(), 2);
        assert!(records[0].timestamp_ms <= records[1].timestamp_ms);
    }

    #[test]
    fn response_is_surfaced_before_any_close() {
        let mut session = streaming_session();

        let actions = session.on_bytes(&response_bytes(b"FW 03.27.14"));
        assert_eq!(actions, vec![SessionAction::Response {
            text: "FW 03.27.14".to_string(),
            crc_ok: true,
        }]);
    }

    #[test]
    fn pipelined_frames_decode_in_one_pass() {
        let mut session = streaming_session();

        let mut wire = batch_bytes();
        wire.extend_from_slice(&response_bytes(b"ra"));

        let actions = session.on_bytes(&wire);
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], SessionAction::Write(_)));
        assert!(matches!(actions[1], SessionAction::Batch { .. }));
        assert_eq!(actions[2], SessionAction::Response { text: "ra".to_string(), crc_ok: true });
    }

    #[test]
    fn bytes_pipelined_behind_the_identity_wait_for_the_verdict() {
        let mut session = DeviceSession::new(MAX_BUFFER);

        let mut wire = handshake_bytes("353691844288760");
        wire.extend_from_slice(&batch_bytes());

        let actions = session.on_bytes(&wire);
        assert!(matches!(&actions[..], [SessionAction::Authenticate { .. }]));

        // The buffered batch decodes as soon as the session is accepted
        let actions = session.resolve_handshake(HandshakeVerdict::Accept);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0], SessionAction::Write(Bytes::from_static(&[0x01])));
        assert!(matches!(actions[1], SessionAction::Write(_)));
        assert!(matches!(actions[2], SessionAction::Batch { .. }));
    }

    #[test]
    fn malformed_stream_closes_with_protocol_error() {
        let mut session = streaming_session();

        let actions = session.on_bytes(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x77,
            0x00, 0x00, 0x00]);
        assert_eq!(actions, vec![SessionAction::Close { reason: CloseReason::ProtocolError }]);
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn second_identity_frame_mid_stream_is_fatal() {
        let mut session = streaming_session();

        let actions = session.on_bytes(&handshake_bytes("353691844288760"));
        assert_eq!(actions, vec![SessionAction::Close { reason: CloseReason::ProtocolError }]);
    }

    #[test]
    fn oversized_buffer_is_fatal() {
        let mut session = DeviceSession::new(16);

        let actions = session.on_bytes(&[0u8; 17]);
        assert_eq!(actions, vec![SessionAction::Close { reason: CloseReason::ProtocolError }]);
    }

    #[test]
    fn split_batch_keeps_the_remainder() {
        let mut session = streaming_session();
        let wire = batch_bytes();
        let (head, tail) = wire.split_at(20);

        assert!(session.on_bytes(head).is_empty());
        let actions = session.on_bytes(tail);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[1], SessionAction::Batch { .. }));
    }

    proptest! {
        #[test]
        fn arbitrary_chunking_never_panics(
            payload in prop::collection::vec(any::<u8>(), 0..512),
            split in 1usize..48,
        ) {
            let mut session = streaming_session();
            for chunk in payload.chunks(split) {
                let _ = session.on_bytes(chunk);
            }
        }

        #[test]
        fn real_frames_survive_any_split(split in 1usize..80) {
            // A batch and a response, delivered in fixed-size slices: the
            // same frames must come out regardless of chunk boundaries
            let mut wire = batch_bytes();
            wire.extend_from_slice(&response_bytes(b"ok"));

            let mut session = streaming_session();
            let mut seen = Vec::new();
            for chunk in wire.chunks(split) {
                seen.extend(session.on_bytes(chunk));
            }

            prop_assert_eq!(seen.len(), 3);
            let is_write = matches!(seen[0], SessionAction::Write(_));
            prop_assert!(is_write);
            let is_batch = matches!(seen[1], SessionAction::Batch { .. });
            prop_assert!(is_batch);
            let is_ok_response =
                matches!(&seen[2], SessionAction::Response { text, .. } if text == "ok");
            prop_assert!(is_ok_response);
        }
    }
}
