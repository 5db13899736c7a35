//! Decoded telemetry data model.
//!
//! An [`AvlRecord`] is one positioning sample with its I/O channel
//! readings. Records are produced by the batch decoder, emitted once to the
//! event sink, and never retained by the gateway.

use crate::error::ProtocolError;

/// Binary framings carrying AVL batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Codec 8: 8-bit event ids, 8-bit I/O keys and counts.
    Codec8,
    /// Codec 8 Extended: 16-bit event ids, keys and counts, plus a
    /// variable-length I/O group.
    Codec8Ext,
}

impl Codec {
    /// Wire codec id byte.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Codec8 => 0x08,
            Self::Codec8Ext => 0x8E,
        }
    }
}

impl TryFrom<u8> for Codec {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x08 => Ok(Self::Codec8),
            0x8E => Ok(Self::Codec8Ext),
            other => Err(ProtocolError::UnknownCodec(other)),
        }
    }
}

/// Record priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Routine periodic sample.
    Low,
    /// Event-triggered sample.
    High,
    /// Panic / alarm sample.
    Panic,
    /// Security channel sample.
    Security,
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::High,
            2 => Self::Panic,
            _ => Self::Security,
        }
    }
}

/// GPS element of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    /// Decimal degrees, negative south.
    pub latitude: f64,
    /// Decimal degrees, negative west.
    pub longitude: f64,
    /// Meters above sea level.
    pub altitude: u16,
    /// Heading in degrees, 0-359, 0 = north.
    pub angle: u16,
    /// Visible satellite count.
    pub satellites: u8,
    /// Speed in km/h.
    pub speed: u16,
}

impl GpsFix {
    /// Whether the receiver had a position lock when the record was taken.
    ///
    /// The wire carries no explicit validity flag; a satellite count of
    /// zero marks a record captured without a fix.
    #[must_use]
    pub fn has_fix(&self) -> bool {
        self.satellites > 0
    }
}

/// Value of one I/O channel reading.
///
/// The width is fixed by the group the element was carried in; Codec 8
/// Extended additionally allows variable-length values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoValue {
    /// 1-byte value.
    U8(u8),
    /// 2-byte value.
    U16(u16),
    /// 4-byte value.
    U32(u32),
    /// 8-byte value.
    U64(u64),
    /// Variable-length value (Codec 8 Extended only).
    Bytes(Vec<u8>),
}

/// One I/O channel reading: numeric key plus typed value.
///
/// Keys may repeat within a record; the element list preserves wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoElement {
    /// Channel key. Codec 8 keys are a single byte widened to `u16`.
    pub id: u16,
    /// Channel value.
    pub value: IoValue,
}

/// One telemetry sample from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlRecord {
    /// UTC timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Priority class.
    pub priority: Priority,
    /// GPS element.
    pub fix: GpsFix,
    /// Id of the I/O channel that triggered the record, zero for periodic
    /// samples. 8-bit on Codec 8, 16-bit on Codec 8 Extended.
    pub event_id: u16,
    /// I/O channel readings in wire order.
    pub io: Vec<IoElement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trips_through_id() {
        assert_eq!(Codec::try_from(0x08).unwrap(), Codec::Codec8);
        assert_eq!(Codec::try_from(0x8E).unwrap(), Codec::Codec8Ext);
        assert_eq!(Codec::Codec8.id(), 0x08);
        assert_eq!(Codec::Codec8Ext.id(), 0x8E);
    }

    #[test]
    fn unknown_codec_rejected() {
        assert!(matches!(Codec::try_from(0x10), Err(ProtocolError::UnknownCodec(0x10))));
    }

    #[test]
    fn priority_from_wire_byte() {
        assert_eq!(Priority::from(0), Priority::Low);
        assert_eq!(Priority::from(1), Priority::High);
        assert_eq!(Priority::from(2), Priority::Panic);
        assert_eq!(Priority::from(3), Priority::Security);
    }

    #[test]
    fn fix_validity_follows_satellite_count() {
        let mut fix = GpsFix {
            latitude: 54.714_7,
            longitude: 25.303_2,
            altitude: 110,
            angle: 0,
            satellites: 7,
            speed: 42,
        };
        assert!(fix.has_fix());

        fix.satellites = 0;
        assert!(!fix.has_fix());
    }
}
