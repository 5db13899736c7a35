//! Frame classification, decoding, and command encoding.
//!
//! All three framings are length-prefixed, so decoding is two-phase:
//! [`classify`] peeks at a buffer without consuming anything, then the
//! matching `decode_*` function either returns [`Decoded::Complete`] with
//! the number of bytes consumed, [`Decoded::Partial`] when the buffer ends
//! mid-frame, or a [`ProtocolError`] when the stream is unrecoverable.
//!
//! # Envelope
//!
//! AVL batches and Codec 12 frames share one envelope:
//!
//! ```text
//! [preamble: 4 x 0x00] [data length D: u32 BE] [data: D bytes] [CRC: u32 BE]
//! ```
//!
//! The CRC trailer carries CRC-16/IBM of the data region in its low 16
//! bits. A mismatch is reported via `crc_ok` on the decoded value, not as
//! an error - some devices mis-compute it and their data is still good.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    crc::crc16,
    error::ProtocolError,
    record::{AvlRecord, Codec, GpsFix, IoElement, IoValue, Priority},
};

/// Preamble plus data-length prefix.
const ENVELOPE_HEAD: usize = 8;

/// CRC trailer width.
const ENVELOPE_TAIL: usize = 4;

/// Largest data region the decoder accepts. The protocol caps a whole
/// frame at `i32::MAX` bytes; the session layer applies its own much
/// smaller read-buffer cap long before this one matters.
const MAX_DATA_BYTES: usize = i32::MAX as usize - ENVELOPE_HEAD - ENVELOPE_TAIL;

/// Codec 12 command direction bytes.
const CODEC12_REQUEST: u8 = 0x05;
const CODEC12_RESPONSE: u8 = 0x06;

/// Outcome of a decode attempt over a possibly incomplete buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A whole frame was present and parsed.
    Complete(T),
    /// The buffer ends mid-frame; retry with more bytes.
    Partial,
}

/// What the front of a buffer looks like. Returned by [`classify`], which
/// never consumes bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Length-prefixed ASCII device identity.
    Handshake,
    /// Codec 8 / 8 Extended telemetry batch.
    AvlBatch,
    /// Codec 12 response envelope.
    Codec12Response,
    /// Not enough bytes to tell yet.
    NeedMoreBytes,
    /// The buffer cannot begin a valid frame.
    Malformed,
}

/// Decoded handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    /// Device identity as sent; syntactic validation happens upstream.
    pub imei: String,
    /// Bytes consumed from the buffer.
    pub consumed: usize,
}

/// Decoded AVL batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlBatch {
    /// Framing the batch arrived in.
    pub codec: Codec,
    /// Records in wire order. The leading and trailing counts have been
    /// verified equal to this length.
    pub records: Vec<AvlRecord>,
    /// Whether the CRC trailer matched the data region.
    pub crc_ok: bool,
    /// Bytes consumed from the buffer.
    pub consumed: usize,
}

/// Decoded Codec 12 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Response text. Devices answer in ASCII; anything else is carried
    /// through lossily rather than dropped.
    pub text: String,
    /// Whether the CRC trailer matched the data region.
    pub crc_ok: bool,
    /// Bytes consumed from the buffer.
    pub consumed: usize,
}

/// Classify the front of a buffer without consuming anything.
///
/// A zero 16-bit prefix marks the envelope preamble; any other prefix is
/// read as the length of an ASCII identity frame. Twelve bytes of an
/// envelope are enough to see the codec id and the Codec 12 type byte.
#[must_use]
pub fn classify(buf: &[u8]) -> FrameKind {
    if buf.len() < 2 {
        return FrameKind::NeedMoreBytes;
    }

    if buf[0] == 0 && buf[1] == 0 {
        if buf.iter().take(4).any(|&b| b != 0) {
            return FrameKind::Malformed;
        }
        if buf.len() < 12 {
            return FrameKind::NeedMoreBytes;
        }
        return match buf[8] {
            0x0C if buf[10] == CODEC12_RESPONSE => FrameKind::Codec12Response,
            0x08 | 0x8E => FrameKind::AvlBatch,
            _ => FrameKind::Malformed,
        };
    }

    let len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
    let body = &buf[2..buf.len().min(2 + len)];
    if !body.iter().all(u8::is_ascii_digit) {
        return FrameKind::Malformed;
    }
    if buf.len() < 2 + len { FrameKind::NeedMoreBytes } else { FrameKind::Handshake }
}

/// Decode a handshake frame: 2-byte big-endian length, then that many
/// ASCII decimal digits.
pub fn decode_handshake(buf: &[u8]) -> Result<Decoded<HandshakeFrame>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Decoded::Partial);
    }

    let len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
    if len == 0 {
        return Err(ProtocolError::BadHandshake);
    }

    let total = 2 + len;
    let body = &buf[2..buf.len().min(total)];
    if !body.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::BadHandshake);
    }
    if buf.len() < total {
        return Ok(Decoded::Partial);
    }

    let imei =
        String::from_utf8(body.to_vec()).map_err(|_| ProtocolError::BadHandshake)?;

    Ok(Decoded::Complete(HandshakeFrame { imei, consumed: total }))
}

/// Decode a Codec 8 / 8 Extended AVL batch.
///
/// The leading and trailing record counts must agree, and every record's
/// declared I/O element total must match its width groups. The CRC is
/// verified but a mismatch only clears `crc_ok`.
pub fn decode_avl(buf: &[u8]) -> Result<Decoded<AvlBatch>, ProtocolError> {
    let Some((data, wire_crc, consumed)) = split_envelope(buf)? else {
        return Ok(Decoded::Partial);
    };

    let crc_ok = crc16(data) == wire_crc;

    let mut r = Reader::new(data);
    let codec = Codec::try_from(r.u8("codec id")?)?;

    let leading = u16::from(r.u8("record count")?);
    let mut records = Vec::with_capacity(usize::from(leading));
    for _ in 0..leading {
        records.push(read_record(&mut r, codec)?);
    }

    let trailing = u16::from(r.u8("trailing record count")?);
    if trailing != leading {
        return Err(ProtocolError::CountMismatch { leading, trailing });
    }
    r.finish()?;

    Ok(Decoded::Complete(AvlBatch { codec, records, crc_ok, consumed }))
}

/// Decode a Codec 12 response envelope (type 0x06).
///
/// Layout inside the data region: codec id 0x0C, quantity 1, type byte,
/// 4-byte response size, the response bytes, trailing quantity 1.
pub fn decode_codec12_response(buf: &[u8]) -> Result<Decoded<ResponseFrame>, ProtocolError> {
    let Some((data, wire_crc, consumed)) = split_envelope(buf)? else {
        return Ok(Decoded::Partial);
    };

    let crc_ok = crc16(data) == wire_crc;

    let mut r = Reader::new(data);
    if r.u8("codec id")? != 0x0C {
        return Err(ProtocolError::BadCommandFrame("codec id"));
    }
    if r.u8("quantity")? != 1 {
        return Err(ProtocolError::BadCommandFrame("leading quantity"));
    }
    if r.u8("type")? != CODEC12_RESPONSE {
        return Err(ProtocolError::BadCommandFrame("transfer type"));
    }

    let size = r.u32("response size")? as usize;
    let text = String::from_utf8_lossy(r.take(size, "response text")?).into_owned();

    if r.u8("trailing quantity")? != 1 {
        return Err(ProtocolError::BadCommandFrame("trailing quantity"));
    }
    r.finish()?;

    Ok(Decoded::Complete(ResponseFrame { text, crc_ok, consumed }))
}

/// Encode a Codec 12 command request (type 0x05) for `text`.
///
/// Produces the full envelope including preamble, data length, and the
/// CRC trailer computed over the data region.
#[must_use]
pub fn encode_codec12_request(text: &str) -> Bytes {
    let cmd = text.as_bytes();
    let data_len = 8 + cmd.len();

    let mut out = BytesMut::with_capacity(ENVELOPE_HEAD + data_len + ENVELOPE_TAIL);
    out.put_u32(0);
    out.put_u32(data_len as u32);
    out.put_u8(0x0C);
    out.put_u8(0x01);
    out.put_u8(CODEC12_REQUEST);
    out.put_u32(cmd.len() as u32);
    out.put_slice(cmd);
    out.put_u8(0x01);

    let crc = crc16(&out[ENVELOPE_HEAD..ENVELOPE_HEAD + data_len]);
    out.put_u32(u32::from(crc));

    out.freeze()
}

/// Split a complete envelope into its data region, wire CRC, and total
/// length. `None` means the buffer ends mid-frame.
fn split_envelope(buf: &[u8]) -> Result<Option<(&[u8], u16, usize)>, ProtocolError> {
    if buf.len() < ENVELOPE_HEAD {
        if buf.iter().take(4).any(|&b| b != 0) {
            return Err(ProtocolError::BadPreamble);
        }
        return Ok(None);
    }

    if buf[0..4] != [0, 0, 0, 0] {
        return Err(ProtocolError::BadPreamble);
    }

    let data_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if data_len > MAX_DATA_BYTES {
        return Err(ProtocolError::LengthOverflow { len: data_len, max: MAX_DATA_BYTES });
    }

    let total = ENVELOPE_HEAD + data_len + ENVELOPE_TAIL;
    if buf.len() < total {
        return Ok(None);
    }

    let data = &buf[ENVELOPE_HEAD..ENVELOPE_HEAD + data_len];
    let tail = &buf[ENVELOPE_HEAD + data_len..total];
    let wire_crc = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]) as u16;

    Ok(Some((data, wire_crc, total)))
}

/// Read one AVL record at the cursor.
fn read_record(r: &mut Reader<'_>, codec: Codec) -> Result<AvlRecord, ProtocolError> {
    let timestamp_ms = r.u64("timestamp")?;
    let priority = Priority::from(r.u8("priority")?);

    let latitude = f64::from(r.i32("latitude")?) / 1e7;
    let longitude = f64::from(r.i32("longitude")?) / 1e7;
    let altitude = r.u16("altitude")?;
    let angle = r.u16("angle")?;
    let satellites = r.u8("satellites")?;
    let speed = r.u16("speed")?;

    let event_id = read_key(r, codec, "event id")?;
    let declared = read_count(r, codec, "i/o total")?;

    let mut io = Vec::with_capacity(usize::from(declared));

    let n = read_count(r, codec, "1-byte group count")?;
    for _ in 0..n {
        let id = read_key(r, codec, "1-byte element key")?;
        io.push(IoElement { id, value: IoValue::U8(r.u8("1-byte element value")?) });
    }

    let n = read_count(r, codec, "2-byte group count")?;
    for _ in 0..n {
        let id = read_key(r, codec, "2-byte element key")?;
        io.push(IoElement { id, value: IoValue::U16(r.u16("2-byte element value")?) });
    }

    let n = read_count(r, codec, "4-byte group count")?;
    for _ in 0..n {
        let id = read_key(r, codec, "4-byte element key")?;
        io.push(IoElement { id, value: IoValue::U32(r.u32("4-byte element value")?) });
    }

    let n = read_count(r, codec, "8-byte group count")?;
    for _ in 0..n {
        let id = read_key(r, codec, "8-byte element key")?;
        io.push(IoElement { id, value: IoValue::U64(r.u64("8-byte element value")?) });
    }

    if codec == Codec::Codec8Ext {
        let n = r.u16("variable group count")?;
        for _ in 0..n {
            let id = r.u16("variable element key")?;
            let len = r.u16("variable element length")? as usize;
            let bytes = r.take(len, "variable element value")?.to_vec();
            io.push(IoElement { id, value: IoValue::Bytes(bytes) });
        }
    }

    let parsed = io.len() as u16;
    if parsed != declared {
        return Err(ProtocolError::IoCountMismatch { declared, parsed });
    }

    Ok(AvlRecord {
        timestamp_ms,
        priority,
        fix: GpsFix { latitude, longitude, altitude, angle, satellites, speed },
        event_id,
        io,
    })
}

/// Event ids and I/O keys: one byte on Codec 8, two on 8 Extended.
fn read_key(r: &mut Reader<'_>, codec: Codec, what: &'static str) -> Result<u16, ProtocolError> {
    match codec {
        Codec::Codec8 => Ok(u16::from(r.u8(what)?)),
        Codec::Codec8Ext => r.u16(what),
    }
}

/// I/O group counts: one byte on Codec 8, two on 8 Extended.
fn read_count(r: &mut Reader<'_>, codec: Codec, what: &'static str) -> Result<u16, ProtocolError> {
    match codec {
        Codec::Codec8 => Ok(u16::from(r.u8(what)?)),
        Codec::Codec8Ext => r.u16(what),
    }
}

/// Bounds-checked big-endian cursor over a data region.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or(ProtocolError::Truncated(what))?;
        let slice = self.buf.get(self.pos..end).ok_or(ProtocolError::Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, ProtocolError> {
        let b = self.take(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, ProtocolError> {
        let b = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// The data region must be fully consumed once the structure closes.
    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos == self.buf.len() { Ok(()) } else { Err(ProtocolError::TrailingBytes) }
    }
}
