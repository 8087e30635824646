// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The encoding half of a QPACK connection: chooses a representation for
//! each header field (indexed, literal-with-name-reference, or fully
//! literal), drives the dynamic table and the blocked-stream budget, and
//! tracks in-flight header blocks until the peer decoder acknowledges them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::decoder::{encode_largest_reference, Acknowledgment};
use crate::error::{QpackError, QpackResult};
use crate::header::{is_never_index_default, FieldName, FieldValue, HeaderField, HeaderList};
use crate::table::dynamic::{DynLookup, EncoderTable};
use crate::table::static_table;
use crate::wire::{write_prefixed_int, write_string, HuffmanPolicy};

/// One in-flight header block's claim on the dynamic table: the bases it
/// pinned via [`EncoderTable::reference`] and the greatest of them, used to
/// decide whether the stream counts against `max_blocked_streams`.
#[derive(Debug, Default)]
struct StreamUsage {
    bases: Vec<u64>,
    largest_reference: u64,
}

/// A field's chosen wire representation, deferred until the block's `base`
/// (the largest reference across every field in the block) is known.
enum FieldRepr {
    IndexedStatic(usize),
    IndexedDynamic(u64),
    LiteralWithNameRefStatic {
        index: usize,
        value: FieldValue,
        never_index: bool,
    },
    LiteralWithNameRefDynamic {
        base: u64,
        value: FieldValue,
        never_index: bool,
    },
    LiteralWithLiteralName {
        name: FieldName,
        value: FieldValue,
        never_index: bool,
    },
}

/// The encoding half of a connection. `write_header_block` and the
/// acknowledgment operations take the caller's stream writers as closures
/// rather than owning transport handles, the same convention
/// [`crate::decoder::Decoder`] uses for `service_updates`/`service_acknowledgments`.
pub struct Encoder {
    table: EncoderTable,
    max_blocked_streams: AtomicU64,
    blocked_streams: Mutex<HashSet<u64>>,
    in_flight: Mutex<HashMap<u64, VecDeque<StreamUsage>>>,
    highest_acknowledged: AtomicU64,
    index_preference: Mutex<HashMap<FieldName, bool>>,
}

impl Encoder {
    pub fn new(capacity: usize, margin: usize, max_blocked_streams: u64) -> Encoder {
        Encoder {
            table: EncoderTable::new(capacity, margin),
            max_blocked_streams: AtomicU64::new(max_blocked_streams),
            blocked_streams: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            highest_acknowledged: AtomicU64::new(0),
            index_preference: Mutex::new(HashMap::new()),
        }
    }

    fn max_entries(&self) -> u64 {
        (self.table.capacity() / 32) as u64
    }

    /// Must only be called before any insert; callers must honor this
    /// contract, it is not enforced at runtime. Emits a
    /// set-dynamic-capacity instruction on `update_stream`.
    pub fn set_capacity(&self, mut update_stream: impl FnMut(&[u8]) -> QpackResult<()>, capacity: usize) -> QpackResult<()> {
        self.table.set_capacity(capacity)?;
        let mut instr = Vec::new();
        write_prefixed_int(&mut instr, 5, 0x20, capacity as u64);
        update_stream(&instr)
    }

    pub fn set_index_preference(&self, name: FieldName, on: bool) {
        self.index_preference.lock().insert(name, on);
    }

    pub fn clear_index_preference(&self, name: &FieldName) {
        self.index_preference.lock().remove(name);
    }

    fn indexing_allowed(&self, name: &FieldName) -> bool {
        if let Some(pref) = self.index_preference.lock().get(name) {
            return *pref;
        }
        !is_never_index_default(name)
    }

    /// Must not be reduced below the number of streams currently blocked.
    pub fn set_max_blocked_streams(&self, m: u64) -> QpackResult<()> {
        if self.blocked_streams.lock().len() as u64 > m {
            return Err(QpackError::BlockedStreamBudget);
        }
        self.max_blocked_streams.store(m, Ordering::Release);
        Ok(())
    }

    /// Emits encoder instructions for any new dynamic-table entries on
    /// `update_stream`, then a complete header block for `headers` on
    /// `block_writer`, tagged with `stream_id`. Instructions for a block are
    /// always flushed before the block itself.
    pub fn write_header_block(
        &self,
        mut update_stream: impl FnMut(&[u8]) -> QpackResult<()>,
        mut block_writer: impl FnMut(&[u8]) -> QpackResult<()>,
        stream_id: u64,
        headers: &HeaderList,
    ) -> QpackResult<()> {
        let highest_acknowledged = self.highest_acknowledged.load(Ordering::Acquire);
        let max_base = {
            let blocked = self.blocked_streams.lock();
            if blocked.contains(&stream_id) {
                u64::MAX
            } else if (blocked.len() as u64) < self.max_blocked_streams.load(Ordering::Acquire) {
                u64::MAX
            } else {
                highest_acknowledged
            }
        };

        let mut usage = StreamUsage::default();
        let mut reprs = Vec::with_capacity(headers.len());
        for field in headers {
            let repr = self.select_representation(max_base, field, &mut usage, &mut update_stream)?;
            reprs.push(repr);
        }

        let encoded_largest = encode_largest_reference(usage.largest_reference, self.max_entries());
        let mut block = Vec::new();
        write_prefixed_int(&mut block, 8, 0, encoded_largest);
        write_prefixed_int(&mut block, 7, 0x00, 0);
        for repr in &reprs {
            encode_repr(&mut block, repr, usage.largest_reference);
        }
        block_writer(&block)?;

        trace!(
            "encoder wrote header block stream={} largest_reference={}",
            stream_id,
            usage.largest_reference
        );

        if !usage.bases.is_empty() {
            if usage.largest_reference > highest_acknowledged {
                self.blocked_streams.lock().insert(stream_id);
            }
            self.in_flight.lock().entry(stream_id).or_default().push_back(usage);
        }
        Ok(())
    }

    fn select_representation(
        &self,
        max_base: u64,
        field: &HeaderField,
        usage: &mut StreamUsage,
        update_stream: &mut impl FnMut(&[u8]) -> QpackResult<()>,
    ) -> QpackResult<FieldRepr> {
        let name = field.name.as_bytes();
        let value = field.value.as_bytes();
        let never_index = field.sensitive || !self.indexing_allowed(&field.name);

        let static_lookup = static_table::lookup(name, value);
        let min_base = self.table.referenceable_min_base();
        let prefix_lookup = if min_base <= max_base {
            self.table.find(name, value, min_base, max_base)
        } else {
            DynLookup::default()
        };

        // A full match never requires a table mutation, whether it lives in
        // the static table (public, fixed) or was already present in the
        // dynamic table before this field was considered. The never-index
        // bit only governs whether *new* entries may be inserted below.
        if let Some(index) = static_lookup.full_match {
            return Ok(FieldRepr::IndexedStatic(index));
        }
        if let Some(base) = prefix_lookup.full_match {
            self.table.reference(base);
            usage.bases.push(base);
            usage.largest_reference = usage.largest_reference.max(base);
            return Ok(FieldRepr::IndexedDynamic(base));
        }

        if !never_index {
            let insert_count = self.table.insert_count();
            let blocked_full_match = if max_base < insert_count {
                self.table
                    .find(name, value, max_base.saturating_add(1), insert_count)
                    .full_match
                    .is_some()
            } else {
                false
            };

            if !blocked_full_match {
                let tail_max = min_base.saturating_sub(1).min(max_base);
                let at_risk_lookup = if tail_max >= 1 {
                    self.table.find(name, value, 1, tail_max)
                } else {
                    DynLookup::default()
                };

                if let Some(base) = at_risk_lookup.full_match {
                    if base <= self.highest_acknowledged.load(Ordering::Acquire) {
                        let ic_before = self.table.insert_count();
                        let new_base = self.table.duplicate(base)?;
                        let mut instr = Vec::new();
                        write_prefixed_int(&mut instr, 5, 0x00, ic_before - base);
                        update_stream(&instr)?;
                        debug!("encoder duplicated dynamic entry base={} as base={}", base, new_base);
                        self.table.reference(new_base);
                        usage.bases.push(new_base);
                        usage.largest_reference = usage.largest_reference.max(new_base);
                        return Ok(FieldRepr::IndexedDynamic(new_base));
                    }
                }

                if field.table_size() <= self.table.capacity() {
                    let mut instr = Vec::new();
                    let new_base = if let Some(dyn_name_base) = prefix_lookup.name_match.or(at_risk_lookup.name_match) {
                        let ic_before = self.table.insert_count();
                        write_prefixed_int(&mut instr, 6, 0x80, ic_before - dyn_name_base);
                        write_string(&mut instr, 8, 0, HuffmanPolicy::Auto, value);
                        self.table.insert(field.name.clone(), field.value.clone())?
                    } else if let Some(static_name_index) = static_lookup.name_match {
                        write_prefixed_int(&mut instr, 6, 0xC0, static_name_index as u64);
                        write_string(&mut instr, 8, 0, HuffmanPolicy::Auto, value);
                        self.table.insert(field.name.clone(), field.value.clone())?
                    } else {
                        write_string(&mut instr, 6, 0x40, HuffmanPolicy::Auto, name);
                        write_string(&mut instr, 8, 0, HuffmanPolicy::Auto, value);
                        self.table.insert(field.name.clone(), field.value.clone())?
                    };
                    update_stream(&instr)?;
                    debug!("encoder inserted dynamic entry base={}", new_base);
                    self.table.reference(new_base);
                    usage.bases.push(new_base);
                    usage.largest_reference = usage.largest_reference.max(new_base);
                    return Ok(FieldRepr::IndexedDynamic(new_base));
                }
            }
        }

        Ok(self.literal_fallback(field, never_index, static_lookup.name_match, prefix_lookup.name_match, usage))
    }

    /// Prefers a dynamic name match over a static one: a name just found
    /// inside the referenceable prefix is usually cheaper to address than
    /// whatever static index it happens to also have.
    fn literal_fallback(
        &self,
        field: &HeaderField,
        never_index: bool,
        static_name_match: Option<usize>,
        dynamic_name_match: Option<u64>,
        usage: &mut StreamUsage,
    ) -> FieldRepr {
        if let Some(base) = dynamic_name_match {
            self.table.reference(base);
            usage.bases.push(base);
            usage.largest_reference = usage.largest_reference.max(base);
            FieldRepr::LiteralWithNameRefDynamic {
                base,
                value: field.value.clone(),
                never_index,
            }
        } else if let Some(index) = static_name_match {
            FieldRepr::LiteralWithNameRefStatic {
                index,
                value: field.value.clone(),
                never_index,
            }
        } else {
            FieldRepr::LiteralWithLiteralName {
                name: field.name.clone(),
                value: field.value.clone(),
                never_index,
            }
        }
    }

    /// Consumes a header-block acknowledgment: releases the references the
    /// oldest in-flight record for `stream_id` holds, and reevaluates
    /// whether the stream still counts against `max_blocked_streams`.
    pub fn acknowledge_header(&self, stream_id: u64) -> QpackResult<()> {
        let mut in_flight = self.in_flight.lock();
        let usage = {
            let queue = in_flight.get_mut(&stream_id).ok_or(QpackError::InvalidFrame)?;
            let usage = queue.pop_front().ok_or(QpackError::InvalidFrame)?;
            if queue.is_empty() {
                in_flight.remove(&stream_id);
            }
            usage
        };
        for base in &usage.bases {
            self.table.release(*base);
        }
        let highest_acknowledged = self.highest_acknowledged.load(Ordering::Acquire);
        let still_blocked = in_flight
            .get(&stream_id)
            .is_some_and(|q| q.iter().any(|u| u.largest_reference > highest_acknowledged));
        let mut blocked = self.blocked_streams.lock();
        if still_blocked {
            blocked.insert(stream_id);
        } else {
            blocked.remove(&stream_id);
        }
        trace!("encoder acknowledged header block stream={}", stream_id);
        Ok(())
    }

    /// Consumes a table-state-synchronize acknowledgment: advances
    /// `highest_acknowledged` and unblocks any stream whose largest
    /// reference no longer exceeds it.
    pub fn acknowledge_insert(&self, delta: u64) -> QpackResult<()> {
        let highest_acknowledged = self.highest_acknowledged.fetch_add(delta, Ordering::AcqRel) + delta;
        let in_flight = self.in_flight.lock();
        self.blocked_streams.lock().retain(|stream_id| {
            in_flight
                .get(stream_id)
                .is_some_and(|q| q.iter().any(|u| u.largest_reference > highest_acknowledged))
        });
        debug!("encoder synchronized table state highest_acknowledged={}", highest_acknowledged);
        Ok(())
    }

    /// Consumes a stream-cancellation acknowledgment: releases every
    /// reference the canceled stream's in-flight records held.
    pub fn acknowledge_reset(&self, stream_id: u64) -> QpackResult<()> {
        if let Some(queue) = self.in_flight.lock().remove(&stream_id) {
            for usage in queue {
                for base in &usage.bases {
                    self.table.release(*base);
                }
            }
        }
        self.blocked_streams.lock().remove(&stream_id);
        trace!("encoder released stream {} after cancellation", stream_id);
        Ok(())
    }

    /// Parses and dispatches every acknowledgment in `buf`.
    pub fn service_acknowledgments(&self, mut buf: &[u8]) -> QpackResult<()> {
        while !buf.is_empty() {
            let (ack, consumed) = Acknowledgment::decode(buf)?;
            match ack {
                Acknowledgment::HeaderBlock { stream_id } => self.acknowledge_header(stream_id)?,
                Acknowledgment::StreamCancel { stream_id } => self.acknowledge_reset(stream_id)?,
                Acknowledgment::TableSynchronize { increment } => self.acknowledge_insert(increment)?,
            }
            buf = &buf[consumed..];
        }
        Ok(())
    }
}

fn encode_repr(out: &mut Vec<u8>, repr: &FieldRepr, block_base: u64) {
    match repr {
        FieldRepr::IndexedStatic(index) => {
            write_prefixed_int(out, 6, 0xC0, *index as u64);
        }
        FieldRepr::IndexedDynamic(base) => {
            write_prefixed_int(out, 6, 0x80, block_base - base);
        }
        FieldRepr::LiteralWithNameRefStatic {
            index,
            value,
            never_index,
        } => {
            let pattern = 0x50 | if *never_index { 0x20 } else { 0 };
            write_prefixed_int(out, 4, pattern, *index as u64);
            write_string(out, 8, 0, HuffmanPolicy::Auto, value.as_bytes());
        }
        FieldRepr::LiteralWithNameRefDynamic {
            base,
            value,
            never_index,
        } => {
            let pattern = 0x40 | if *never_index { 0x20 } else { 0 };
            write_prefixed_int(out, 4, pattern, block_base - base);
            write_string(out, 8, 0, HuffmanPolicy::Auto, value.as_bytes());
        }
        FieldRepr::LiteralWithLiteralName {
            name,
            value,
            never_index,
        } => {
            let pattern = 0x20 | if *never_index { 0x10 } else { 0 };
            write_string(out, 4, pattern, HuffmanPolicy::Auto, name.as_bytes());
            write_string(out, 8, 0, HuffmanPolicy::Auto, value.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;
    use std::time::Duration;

    fn fields(pairs: &[(&str, &str)]) -> HeaderList {
        pairs.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
    }

    #[test]
    fn static_only_field_matches_scenario_bytes() {
        let encoder = Encoder::new(256, 256, 100);
        let mut block = Vec::new();
        encoder
            .write_header_block(|_| Ok(()), |b| { block.extend_from_slice(b); Ok(()) }, 0, &fields(&[(":method", "GET")]))
            .unwrap();
        assert_eq!(block, vec![0x00, 0x00, 0xd1]);
    }

    #[test]
    fn insert_and_reference_matches_scenario_prefix() {
        let encoder = Encoder::new(256, 256, 100);
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
                4,
                &headers,
            )
            .unwrap();
        assert!(!instructions.is_empty());
        assert_eq!(instructions[0], 0xC0); // insert-with-name-reference, static index 0
        assert_eq!(&block[..2], &[0x02, 0x00]);
        assert_eq!(block.last().copied().unwrap(), 0x80); // indexed dynamic, relative 0
    }

    #[test]
    fn max_blocked_streams_enforced_across_streams() {
        let encoder = Encoder::new(256, 256, 1);
        let mut instructions = Vec::new();
        let mut block_a = Vec::new();
        encoder
            .write_header_block(
                |b| { instructions.extend_from_slice(b); Ok(()) },
                |b| { block_a.extend_from_slice(b); Ok(()) },
                1,
                &fields(&[("x-custom", "value-one")]),
            )
            .unwrap();
        assert!(!instructions.is_empty(), "first reference must insert and block stream 1");

        instructions.clear();
        let mut block_b = Vec::new();
        encoder
            .write_header_block(
                |b| { instructions.extend_from_slice(b); Ok(()) },
                |b| { block_b.extend_from_slice(b); Ok(()) },
                2,
                &fields(&[("x-custom", "value-one")]),
            )
            .unwrap();
        assert!(instructions.is_empty(), "second stream must not insert while budget is exhausted");
        // Literal-with-literal-name (pattern 001N....), since the matching
        // entry is past max_base and the insert budget is exhausted.
        assert_eq!(block_b[0..2], [0x00, 0x00]);
        assert_eq!(block_b[2] & 0xe0, 0x20);
        let decoder = Decoder::new(256, Duration::from_millis(50));
        let decoded = decoder.read_header_block(2, &block_b).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name.as_bytes(), b"x-custom");
        assert_eq!(decoded[0].value.as_bytes(), b"value-one");
    }

    #[test]
    fn sensitive_field_is_always_literal_never_indexed() {
        let encoder = Encoder::new(256, 256, 100);
        let mut instructions = Vec::new();
        let mut block = Vec::new();
        let headers = vec![HeaderField::sensitive("authorization", "secret-token")];
        encoder
            .write_header_block(
                |b| { instructions.extend_from_slice(b); Ok(()) },
                |b| { block.extend_from_slice(b); Ok(()) },
                7,
                &headers,
            )
            .unwrap();
        assert!(instructions.is_empty(), "sensitive fields must never be inserted");
        // literal-with-name-reference, static, never-index: pattern 0x70 with index 86 (authorization)
        assert_eq!(block[2] & 0xf0, 0x70);
    }

    #[test]
    fn round_trips_through_real_decoder() {
        let encoder = Encoder::new(256, 256, 100);
        let decoder = Decoder::new(256, Duration::from_millis(50));
        let mut instructions = Vec::new();
        let mut block = Vec::new();
        let headers = fields(&[(":method", "GET"), (":authority", "example.com")]);
        encoder
            .write_header_block(
                |b| { instructions.extend_from_slice(b); Ok(()) },
                |b| { block.extend_from_slice(b); Ok(()) },
                9,
                &headers,
            )
            .unwrap();
        decoder.service_updates(&instructions).unwrap();
        let decoded = decoder.read_header_block(9, &block).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].name.as_bytes(), b":method");
        assert_eq!(decoded[0].value.as_bytes(), b"GET");
        assert_eq!(decoded[1].name.as_bytes(), b":authority");
        assert_eq!(decoded[1].value.as_bytes(), b"example.com");
    }
}
