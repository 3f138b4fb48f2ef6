//! Payload reader/writer tests

use peerlink::{Error, MessageReader, MessageWriter};

#[test]
fn primitives_round_trip() {
    let mut writer = MessageWriter::new();
    writer.write_u8(0xAB);
    writer.write_i8(-5);
    writer.write_u16(0xBEEF);
    writer.write_i16(i16::MIN);
    writer.write_u32(0xDEAD_BEEF);
    writer.write_i32(-123_456);
    writer.write_u64(u64::MAX - 1);
    writer.write_i64(i64::MIN + 7);
    writer.write_f32(3.5);
    writer.write_f64(-0.125);
    writer.write_bool(true);
    writer.write_bool(false);
    writer.write_string("hello, wörld").unwrap();
    writer.write_bytes(&[1, 2, 3]).unwrap();
    writer.write_raw(&[9, 8]);
    let bytes = writer.into_inner();

    let mut reader = MessageReader::new(&bytes);
    assert_eq!(reader.read_u8().unwrap(), 0xAB);
    assert_eq!(reader.read_i8().unwrap(), -5);
    assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
    assert_eq!(reader.read_i16().unwrap(), i16::MIN);
    assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
    assert_eq!(reader.read_i32().unwrap(), -123_456);
    assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
    assert_eq!(reader.read_i64().unwrap(), i64::MIN + 7);
    assert_eq!(reader.read_f32().unwrap(), 3.5);
    assert_eq!(reader.read_f64().unwrap(), -0.125);
    assert!(reader.read_bool().unwrap());
    assert!(!reader.read_bool().unwrap());
    assert_eq!(reader.read_string().unwrap(), "hello, wörld");
    assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
    assert_eq!(reader.read_raw(2).unwrap(), &[9, 8]);
    assert_eq!(reader.remaining(), 0);
}

#[test]
fn integers_are_big_endian() {
    let mut writer = MessageWriter::new();
    writer.write_u16(0x0102);
    writer.write_i32(-2);
    writer.write_string("ab").unwrap();
    assert_eq!(
        writer.as_slice(),
        &[0x01, 0x02, 0xFF, 0xFF, 0xFF, 0xFE, 0, 0, 0, 2, b'a', b'b']
    );
}

#[test]
fn reading_past_the_end_is_malformed() {
    let bytes = [0u8, 1, 2];
    let mut reader = MessageReader::new(&bytes);
    assert!(matches!(reader.read_u32(), Err(Error::MalformedData(_))));
    // A failed read consumes nothing
    assert_eq!(reader.position(), 0);
    assert_eq!(reader.read_u16().unwrap(), 1);
    assert!(matches!(reader.read_u16(), Err(Error::MalformedData(_))));
}

#[test]
fn truncated_string_is_malformed() {
    let mut writer = MessageWriter::new();
    writer.write_u32(10);
    writer.write_raw(b"short");
    let bytes = writer.into_inner();
    let mut reader = MessageReader::new(&bytes);
    assert!(matches!(reader.read_string(), Err(Error::MalformedData(_))));
}

#[test]
fn invalid_utf8_is_malformed() {
    let mut writer = MessageWriter::new();
    writer.write_bytes(&[0xFF, 0xFE]).unwrap();
    let bytes = writer.into_inner();
    let mut reader = MessageReader::new(&bytes);
    assert!(matches!(reader.read_string(), Err(Error::MalformedData(_))));
}

#[test]
fn any_non_zero_byte_is_true() {
    let bytes = [0u8, 1, 2, 255];
    let mut reader = MessageReader::new(&bytes);
    assert!(!reader.read_bool().unwrap());
    assert!(reader.read_bool().unwrap());
    assert!(reader.read_bool().unwrap());
    assert!(reader.read_bool().unwrap());
}

#[test]
fn advance_and_remaining_slice() {
    let bytes = [1u8, 2, 3, 4, 5];
    let mut reader = MessageReader::new(&bytes);
    reader.advance(2).unwrap();
    assert_eq!(reader.remaining_slice(), &[3, 4, 5]);
    assert!(reader.advance(4).is_err());
    reader.advance(3).unwrap();
    assert_eq!(reader.remaining(), 0);
}

#[test]
fn clear_keeps_writer_reusable() {
    let mut writer = MessageWriter::with_capacity(16);
    writer.write_u64(7);
    assert_eq!(writer.len(), 8);
    writer.clear();
    assert!(writer.is_empty());
    writer.write_u8(1);
    assert_eq!(writer.as_slice(), &[1]);
}
