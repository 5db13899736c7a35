//! Error types for wire-format decoding.
//!
//! Every variant is an unrecoverable structural fault in the byte stream:
//! incomplete frames are not errors (see [`crate::Decoded::Partial`]), and
//! checksum mismatches are surfaced as flags on the decoded value rather
//! than as errors, because a known population of devices mis-computes the
//! CRC while producing otherwise valid frames.

use thiserror::Error;

/// Structural faults in an inbound byte stream.
///
/// Any of these on an established session means the stream can no longer be
/// re-synchronized; the session must be closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame did not start with the four zero preamble bytes.
    #[error("frame preamble is not zero")]
    BadPreamble,

    /// Declared data length exceeds what the protocol allows.
    #[error("declared data length {len} exceeds limit {max}")]
    LengthOverflow {
        /// Length claimed by the frame
        len: usize,
        /// Maximum the decoder accepts
        max: usize,
    },

    /// Codec id byte is not one this gateway speaks.
    #[error("unknown codec id {0:#04x}")]
    UnknownCodec(u8),

    /// Leading and trailing record counts disagree.
    #[error("record counts disagree: leading {leading}, trailing {trailing}")]
    CountMismatch {
        /// Count before the records
        leading: u16,
        /// Count after the records
        trailing: u16,
    },

    /// Per-record I/O element total does not match the group contents.
    #[error("i/o element count disagrees with groups: declared {declared}, parsed {parsed}")]
    IoCountMismatch {
        /// Total the record header declared
        declared: u16,
        /// Elements actually present in the width groups
        parsed: u16,
    },

    /// Data region ended in the middle of a field.
    #[error("data region truncated while reading {0}")]
    Truncated(&'static str),

    /// Data region continues past the structure it declared.
    #[error("unparsed bytes after trailing record count")]
    TrailingBytes,

    /// Length-prefixed identity frame was not a run of decimal digits.
    #[error("handshake is not a decimal device identity")]
    BadHandshake,

    /// Codec 12 envelope deviates from the fixed command layout.
    #[error("unexpected codec 12 layout: {0}")]
    BadCommandFrame(&'static str),
}
