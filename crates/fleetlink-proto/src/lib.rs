//! Wire formats for the Teltonika AVL protocol family.
//!
//! Pure functions over byte slices: no I/O, no async, no logging. The
//! session engine feeds its read buffer through [`classify`] and the
//! `decode_*` functions; the command dispatcher produces outbound frames
//! with [`encode_codec12_request`].
//!
//! Three framings share the wire:
//!
//! - **Handshake**: a 2-byte big-endian length prefix followed by that many
//!   ASCII decimal digits (the device IMEI). Sent once per connection.
//! - **Codec 8 / 8 Extended**: batched AVL telemetry records inside a
//!   zero-preamble envelope with a CRC-16/IBM trailer.
//! - **Codec 12**: ASCII command requests (type 0x05, server to device) and
//!   responses (type 0x06, device to server) in the same envelope.
//!
//! Decoders never allocate for a frame before its length prefix has been
//! validated, and they consume nothing on [`Decoded::Partial`] - the caller
//! keeps accumulating bytes and retries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod crc;
mod error;
mod frame;
pub mod imei;
mod record;

pub use crc::crc16;
pub use error::ProtocolError;
pub use frame::{
    AvlBatch, Decoded, FrameKind, HandshakeFrame, ResponseFrame, classify, decode_avl,
    decode_codec12_response, decode_handshake, encode_codec12_request,
};
pub use record::{AvlRecord, Codec, GpsFix, IoElement, IoValue, Priority};
