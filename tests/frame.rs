use tokio::io::AsyncWriteExt;

use rpc_mamont::frame::{
    decode_record_mark, encode_record_mark, read_fragment, write_fragment, RecordAssembler,
    MAX_FRAGMENT_SIZE, MAX_RECORD_LENGTH,
};
use rpc_mamont::TransportError;

#[test]
fn record_mark_round_trip() {
    for &len in &[0_usize, 1, 2, 255, 4096, MAX_FRAGMENT_SIZE] {
        for &last in &[false, true] {
            let mark = encode_record_mark(len, last).expect("encode record mark");
            assert_eq!(decode_record_mark(mark), (len, last), "len {len} last {last}");
        }
    }
}

#[test]
fn rejects_length_beyond_31_bits() {
    for len in [MAX_FRAGMENT_SIZE + 1, 0x8000_0000, usize::MAX] {
        let err = encode_record_mark(len, true).expect_err("expected oversize error");
        assert!(matches!(err, TransportError::FrameTooLarge(_)), "unexpected error: {err:?}");
    }
}

#[test]
fn decode_extracts_flag_and_length() {
    assert_eq!(decode_record_mark([0x80, 0x00, 0x00, 0x0a]), (10, true));
    assert_eq!(decode_record_mark([0x00, 0x00, 0x00, 0x0a]), (10, false));
    assert_eq!(decode_record_mark([0xff, 0xff, 0xff, 0xff]), (MAX_FRAGMENT_SIZE, true));
}

/// Wire encoding of `message` split at the given fragment sizes; the last
/// listed fragment carries the remainder and the last-fragment bit.
fn fragment_wire(message: &[u8], splits: &[usize]) -> Vec<u8> {
    let mut wire = Vec::new();
    let mut offset = 0;
    for &size in splits {
        let header = encode_record_mark(size, false).expect("encode fragment header");
        wire.extend_from_slice(&header);
        wire.extend_from_slice(&message[offset..offset + size]);
        offset += size;
    }
    let rest = message.len() - offset;
    let header = encode_record_mark(rest, true).expect("encode last fragment header");
    wire.extend_from_slice(&header);
    wire.extend_from_slice(&message[offset..]);
    wire
}

#[test]
fn reassembly_is_split_independent() {
    let message: Vec<u8> = (0..797_u32).map(|i| (i % 251) as u8).collect();

    let single = fragment_wire(&message, &[]);
    let mut assembler = RecordAssembler::new();
    let records = assembler.feed(&single).expect("feed single fragment");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0], message);

    let fragged = fragment_wire(&message, &[1, 0, 5, 130, 256]);
    let mut assembler = RecordAssembler::new();
    let records = assembler.feed(&fragged).expect("feed multi fragment");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0], message, "multi-fragment reassembly differs");

    // Pathological delivery: the same wire bytes one byte at a time.
    let mut assembler = RecordAssembler::new();
    let mut records = Vec::new();
    for byte in &fragged {
        records.extend(assembler.feed(std::slice::from_ref(byte)).expect("feed single byte"));
    }
    assert_eq!(records.len(), 1);
    assert_eq!(records[0], message, "byte-at-a-time reassembly differs");
}

#[test]
fn assembler_separates_back_to_back_records() {
    let first = b"first record".to_vec();
    let second = b"second".to_vec();
    let mut wire = fragment_wire(&first, &[4]);
    wire.extend_from_slice(&fragment_wire(&second, &[]));

    let mut assembler = RecordAssembler::new();
    let records = assembler.feed(&wire).expect("feed two records");
    assert_eq!(records, vec![first, second]);
    assert_eq!(assembler.pending_len(), 0);
}

#[test]
fn assembler_completes_empty_record() {
    let wire = fragment_wire(&[], &[]);
    let mut assembler = RecordAssembler::new();
    let records = assembler.feed(&wire).expect("feed empty record");
    assert_eq!(records, vec![Vec::<u8>::new()]);
}

#[test]
fn assembler_enforces_record_limit() {
    let header = encode_record_mark(MAX_RECORD_LENGTH + 1, true).expect("encode header");
    let mut assembler = RecordAssembler::new();
    let err = assembler.feed(&header).expect_err("expected oversize error");
    assert!(matches!(err, TransportError::FrameTooLarge(_)), "unexpected error: {err:?}");
}

#[tokio::test]
async fn fragment_stream_round_trip() {
    let payload: Vec<u8> = (0..10_000_u32).map(|i| (i % 256) as u8).collect();
    let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);

    write_fragment(&mut tx, &payload).await.expect("write fragments");

    let mut record = Vec::new();
    loop {
        if read_fragment(&mut rx, &mut record).await.expect("read fragment") {
            break;
        }
    }
    assert_eq!(record, payload);
}

#[tokio::test]
async fn read_rejects_oversized_record() {
    let (mut tx, mut rx) = tokio::io::duplex(1024);
    let header = encode_record_mark(MAX_RECORD_LENGTH + 1, true).expect("encode header");
    tx.write_all(&header).await.expect("write fragment header");

    let mut record = Vec::new();
    let err = read_fragment(&mut rx, &mut record)
        .await
        .expect_err("expected oversize error");
    assert!(matches!(err, TransportError::FrameTooLarge(_)), "unexpected error: {err:?}");
}
