// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Exercises the named end-to-end scenarios against the public API only,
//! driving the encoder and decoder the way a real HTTP/3 stack would: one
//! side writes instructions/blocks, the other services them.

use std::thread;
use std::time::Duration;

use h3qpack::error::QpackError;
use h3qpack::framing::{read_varint, write_varint};
use h3qpack::header::HeaderField;
use h3qpack::wire::{read_prefixed_int, write_prefixed_int};
use h3qpack::{Decoder, Encoder, HeaderList};

fn fields(pairs: &[(&str, &str)]) -> HeaderList {
    pairs.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
}

#[test]
fn static_table_indexed_field_produces_exact_bytes() {
    let encoder = Encoder::new(256, 256, 100);
    let mut block = Vec::new();
    encoder
        .write_header_block(|_| Ok(()), |b| { block.extend_from_slice(b); Ok(()) }, 1, &fields(&[(":method", "GET")]))
        .unwrap();
    assert_eq!(block, vec![0x00, 0x00, 0xd1]);

    let decoder = Decoder::new(256, Duration::from_millis(50));
    let decoded = decoder.read_header_block(1, &block).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].name.as_bytes(), b":method");
    assert_eq!(decoded[0].value.as_bytes(), b"GET");
}

#[test]
fn insert_and_reference_round_trips_with_exact_dynamic_table_state() {
    let encoder = Encoder::new(256, 256, 100);
    let decoder = Decoder::new(256, Duration::from_millis(50));
    let mut instructions = Vec::new();
    let mut block = Vec::new();
    let headers = fields(&[
        (":method", "GET"),
        (":scheme", "http"),
        (":path", "/"),
        (":authority", "www.example.com"),
    ]);
    encoder
        .write_header_block(
            |b| { instructions.extend_from_slice(b); Ok(()) },
            |b| { block.extend_from_slice(b); Ok(()) },
            3,
            &headers,
        )
        .unwrap();

    assert_eq!(&block[..2], &[0x02, 0x00]);
    decoder.service_updates(&instructions).unwrap();
    let decoded = decoder.read_header_block(3, &block).unwrap();
    assert_eq!(decoded, headers);
}

#[test]
fn eviction_under_pressure_drops_oldest_unreferenced_entry() {
    use h3qpack::header::{FieldName, FieldValue};
    use h3qpack::table::dynamic::EncoderTable;

    // 43 bytes fits exactly one "one"/"1" entry (3+1+32=36 < 43) plus slop;
    // two entries (72 bytes) plus a third overflow the capacity and force
    // eviction of the oldest unreferenced one.
    let table = EncoderTable::new(86, 86);
    table.insert(FieldName::from("one"), FieldValue::from("1")).unwrap();
    table.insert(FieldName::from("two"), FieldValue::from("2")).unwrap();
    table.insert(FieldName::from("three"), FieldValue::from("3")).unwrap();

    assert_eq!(table.insert_count(), 3);
    // Base 1 ("one") must have been evicted: the referenceable prefix no
    // longer contains it.
    assert!(table.find(b"one", b"1", 1, 3).full_match.is_none());
    assert!(table.find(b"two", b"2", 1, 3).full_match.is_some());
    assert!(table.find(b"three", b"3", 1, 3).full_match.is_some());
}

#[test]
fn blocking_decode_suspends_until_insert_arrives() {
    let encoder = Encoder::new(256, 256, 100);
    let decoder = std::sync::Arc::new(Decoder::new(256, Duration::from_millis(50)));

    let mut instructions = Vec::new();
    let mut block = Vec::new();
    encoder
        .write_header_block(
            |b| { instructions.extend_from_slice(b); Ok(()) },
            |b| { block.extend_from_slice(b); Ok(()) },
            5,
            &fields(&[("x-custom", "value-one")]),
        )
        .unwrap();
    assert!(!instructions.is_empty());

    let reader_decoder = decoder.clone();
    let block_for_thread = block.clone();
    let handle = thread::spawn(move || reader_decoder.read_header_block(5, &block_for_thread));

    // Give the reader every chance to busy-loop before the instruction
    // that unblocks it arrives.
    thread::sleep(Duration::from_millis(20));
    decoder.service_updates(&instructions).unwrap();

    let decoded = handle.join().unwrap().unwrap();
    assert_eq!(decoded[0].name.as_bytes(), b"x-custom");
    assert_eq!(decoded[0].value.as_bytes(), b"value-one");
}

#[test]
fn max_blocked_streams_forces_literal_on_second_stream() {
    let encoder = Encoder::new(256, 256, 1);
    let mut instructions_a = Vec::new();
    let mut block_a = Vec::new();
    encoder
        .write_header_block(
            |b| { instructions_a.extend_from_slice(b); Ok(()) },
            |b| { block_a.extend_from_slice(b); Ok(()) },
            10,
            &fields(&[("x-custom", "value-one")]),
        )
        .unwrap();
    assert!(!instructions_a.is_empty());

    let mut instructions_b = Vec::new();
    let mut block_b = Vec::new();
    encoder
        .write_header_block(
            |b| { instructions_b.extend_from_slice(b); Ok(()) },
            |b| { block_b.extend_from_slice(b); Ok(()) },
            11,
            &fields(&[("x-custom", "value-one")]),
        )
        .unwrap();
    assert!(instructions_b.is_empty(), "budget exhausted: must not insert again");

    // Acknowledge stream A's block, freeing the budget for a third stream.
    let mut ack = Vec::new();
    h3qpack::decoder::Acknowledgment::HeaderBlock { stream_id: 10 }.encode(&mut ack);
    encoder.service_acknowledgments(&ack).unwrap();

    let mut instructions_c = Vec::new();
    let mut block_c = Vec::new();
    encoder
        .write_header_block(
            |b| { instructions_c.extend_from_slice(b); Ok(()) },
            |b| { block_c.extend_from_slice(b); Ok(()) },
            12,
            &fields(&[("x-other", "value-two")]),
        )
        .unwrap();
    assert!(!instructions_c.is_empty(), "budget freed: a new stream may insert again");
}

#[test]
fn illegal_sign_delta_pair_is_rejected() {
    // largest_reference = 1 (wire value 2 decodes to 1 with max_entries=8),
    // then sign bit 1 with delta 0: the illegal base == largest_reference
    // encoding.
    let decoder = Decoder::new(256, Duration::from_millis(50));
    let mut block = Vec::new();
    write_prefixed_int(&mut block, 8, 0, 2);
    write_prefixed_int(&mut block, 7, 0x80, 0);
    let err = decoder.read_header_block(1, &block).unwrap_err();
    assert_eq!(err, QpackError::InvalidBase);
}

#[test]
fn integer_overflow_is_rejected() {
    let bytes: &[u8] = &[0xff, 0x80, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
    assert_eq!(read_prefixed_int(bytes, 8), Err(QpackError::IntegerOverflow));
}

#[test]
fn varint_corpus_matches_exact_bytes() {
    let cases: &[(u64, &[u8])] = &[
        (0, &[0x00]),
        (63, &[0x3f]),
        (64, &[0x40, 0x40]),
        (16383, &[0x7f, 0xff]),
        (16384, &[0x80, 0x00, 0x40, 0x00]),
        ((1 << 30) - 1, &[0xbf, 0xff, 0xff, 0xff]),
        (1 << 30, &[0xc0, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00]),
        ((1u64 << 62) - 1, &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
    ];
    for &(value, expected) in cases {
        let mut out = Vec::new();
        write_varint(&mut out, value).unwrap();
        assert_eq!(out, expected, "value={value}");
        assert_eq!(read_varint(&out).unwrap(), (value, expected.len()));
    }
}
