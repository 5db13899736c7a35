//! Decoder tests against captured device traffic.
//!
//! The hex strings are real frames from FMB-family devices (the same
//! captures circulate in every implementation of this protocol), so these
//! tests pin the exact field layout, not just self-consistency.

use fleetlink_proto::{
    AvlBatch, Codec, Decoded, IoValue, Priority, ProtocolError, decode_avl,
};

fn frame(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str).unwrap()
}

fn complete(buf: &[u8]) -> AvlBatch {
    match decode_avl(buf).unwrap() {
        Decoded::Complete(batch) => batch,
        Decoded::Partial => panic!("expected a complete batch"),
    }
}

#[test]
fn codec8_single_record() {
    let buf = frame(
        "000000000000003608010000016B40D8EA3001000000000000000000000000000000010502150301\
         0101425E0F01F10000601A014E0000000000000000010000C7CF",
    );
    let batch = complete(&buf);

    assert_eq!(batch.codec, Codec::Codec8);
    assert!(batch.crc_ok);
    assert_eq!(batch.consumed, buf.len());
    assert_eq!(batch.records.len(), 1);

    let rec = &batch.records[0];
    assert_eq!(rec.timestamp_ms, 1_560_161_086_000); // 2019-06-10T10:04:46Z
    assert_eq!(rec.priority, Priority::High);
    assert_eq!(rec.event_id, 1);
    assert!(!rec.fix.has_fix());

    let io: Vec<(u16, &IoValue)> = rec.io.iter().map(|e| (e.id, &e.value)).collect();
    assert_eq!(io, vec![
        (21, &IoValue::U8(3)),
        (1, &IoValue::U8(1)),
        (66, &IoValue::U16(24079)),
        (241, &IoValue::U32(24602)),
        (78, &IoValue::U64(0)),
    ]);
}

#[test]
fn codec8_two_records_in_wire_order() {
    let buf = frame(
        "000000000000004308020000016B40D57B4801000000000000000000000000000000010101010000\
         00000000016B40D5C198010000000000000000000000000000000101010101000000020000252C",
    );
    let batch = complete(&buf);

    assert!(batch.crc_ok);
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.records[0].timestamp_ms, 1_560_160_861_000);
    assert_eq!(batch.records[1].timestamp_ms, 1_560_160_879_000);
    assert!(batch.records[0].timestamp_ms <= batch.records[1].timestamp_ms);
    assert_eq!(batch.records[0].io[0].value, IoValue::U8(0));
    assert_eq!(batch.records[1].io[0].value, IoValue::U8(1));
}

#[test]
fn codec8ext_widened_keys_and_empty_variable_group() {
    let buf = frame(
        "000000000000004A8E010000016B412CEE000100000000000000000000000000000000010005000100\
         010100010011001D00010010015E2C880002000B000000003544C87A000E000000001DD7E06A0000\
         0100002994",
    );
    let batch = complete(&buf);

    assert_eq!(batch.codec, Codec::Codec8Ext);
    assert!(batch.crc_ok);
    assert_eq!(batch.records.len(), 1);

    let rec = &batch.records[0];
    assert_eq!(rec.event_id, 1);
    let io: Vec<(u16, &IoValue)> = rec.io.iter().map(|e| (e.id, &e.value)).collect();
    assert_eq!(io, vec![
        (1, &IoValue::U8(1)),
        (17, &IoValue::U16(29)),
        (16, &IoValue::U32(22_949_000)),
        (11, &IoValue::U64(893_700_218)),
        (14, &IoValue::U64(500_686_954)),
    ]);
}

#[test]
fn crc_mismatch_still_yields_records() {
    let mut buf = frame(
        "000000000000003608010000016B40D8EA3001000000000000000000000000000000010502150301\
         0101425E0F01F10000601A014E0000000000000000010000C7CF",
    );
    let last = buf.len() - 1;
    buf[last] ^= 0x55;

    let batch = complete(&buf);
    assert!(!batch.crc_ok);
    assert_eq!(batch.records.len(), 1);
}

#[test]
fn truncated_batch_is_partial_at_every_cut() {
    let buf = frame(
        "000000000000003608010000016B40D8EA3001000000000000000000000000000000010502150301\
         0101425E0F01F10000601A014E0000000000000000010000C7CF",
    );
    for cut in 0..buf.len() {
        assert_eq!(decode_avl(&buf[..cut]).unwrap(), Decoded::Partial, "cut at {cut}");
    }
}

#[test]
fn count_mismatch_is_fatal() {
    let mut buf = frame(
        "000000000000004308020000016B40D57B4801000000000000000000000000000000010101010000\
         00000000016B40D5C198010000000000000000000000000000000101010101000000020000252C",
    );
    // Trailing count sits just before the CRC trailer
    let idx = buf.len() - 5;
    assert_eq!(buf[idx], 0x02);
    buf[idx] = 0x03;

    assert_eq!(
        decode_avl(&buf),
        Err(ProtocolError::CountMismatch { leading: 2, trailing: 3 })
    );
}
