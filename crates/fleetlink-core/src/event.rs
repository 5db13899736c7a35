//! Events the engine reports and the sink seam that consumes them.
//!
//! The engine calls one [`EventSink`] for everything observable: parsed
//! telemetry, command responses, session lifecycle. Sinks are expected to
//! queue internally; a sink that blocks in `emit` back-pressures the read
//! loop of the session that produced the event, never other sessions.

use std::net::SocketAddr;

use async_trait::async_trait;
use fleetlink_proto::AvlRecord;

/// Why a session ended (or never started).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Unrecoverable parse failure on the byte stream.
    ProtocolError,
    /// Identity failed syntax, checksum, or allow-list checks.
    HandshakeRejected,
    /// Admission controller refused the bind.
    AdmissionDenied,
    /// Another session already holds this identity.
    DuplicateImei,
    /// Peer closed the socket.
    PeerClosed,
    /// Socket read failed.
    ReadError,
    /// Socket write failed.
    WriteError,
    /// Identity frame did not arrive in time.
    HandshakeTimeout,
    /// No traffic for longer than the idle limit.
    IdleTimeout,
    /// Gateway is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Stable lowercase token for logs and events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolError => "protocol_error",
            Self::HandshakeRejected => "handshake_rejected",
            Self::AdmissionDenied => "admission_denied",
            Self::DuplicateImei => "duplicate_imei",
            Self::PeerClosed => "peer_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A socket was accepted and a session created.
    SessionOpened {
        /// Session id.
        session_id: u64,
        /// Peer address at accept time.
        peer: SocketAddr,
    },

    /// A session completed the identity handshake and was bound.
    Authenticated {
        /// Session id.
        session_id: u64,
        /// Bound device identity.
        imei: String,
    },

    /// One telemetry record was parsed.
    AvlRecord {
        /// Identity of the reporting device.
        imei: String,
        /// The record.
        record: AvlRecord,
    },

    /// A Codec 12 response arrived.
    CommandResponse {
        /// Identity of the responding device.
        imei: String,
        /// Response text.
        text: String,
        /// Whether the response paired with an outstanding command. An
        /// unsolicited response is an event, not an error.
        solicited: bool,
    },

    /// A session ended.
    SessionClosed {
        /// Session id.
        session_id: u64,
        /// Bound identity, if the handshake had completed.
        imei: Option<String>,
        /// Why the session ended.
        reason: CloseReason,
    },
}

/// Observer seam for everything the engine produces.
///
/// Implementations must not panic and should return quickly; an
/// asynchronous queue adapter in front of a slow consumer is the expected
/// shape. Delivery is best-effort - the engine never blocks the device ack
/// on sink delivery.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    async fn emit(&self, event: GatewayEvent);
}
