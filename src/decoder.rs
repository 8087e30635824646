// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The decoding half of a QPACK connection: applies encoder instructions
//! to the dynamic table, resolves header blocks against it (blocking
//! callers until the table has advanced far enough), and produces the
//! acknowledgment stream the peer encoder consumes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::trace;
use parking_lot::Mutex;

use crate::error::{QpackError, QpackResult};
use crate::header::{FieldName, FieldValue, HeaderField, HeaderList};
use crate::table::dynamic::{resolve_post_base, resolve_relative, DecoderTable};
use crate::table::static_table;
use crate::wire::{read_prefixed_int, read_string, HuffmanPolicy};

/// Acknowledgments the decoder emits on its dedicated send stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgment {
    HeaderBlock { stream_id: u64 },
    StreamCancel { stream_id: u64 },
    TableSynchronize { increment: u64 },
}

impl Acknowledgment {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Acknowledgment::HeaderBlock { stream_id } => {
                crate::wire::write_prefixed_int(out, 7, 0x80, stream_id);
            }
            Acknowledgment::StreamCancel { stream_id } => {
                crate::wire::write_prefixed_int(out, 6, 0x40, stream_id);
            }
            Acknowledgment::TableSynchronize { increment } => {
                crate::wire::write_prefixed_int(out, 6, 0x00, increment);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> QpackResult<(Acknowledgment, usize)> {
        if buf.is_empty() {
            return Err(QpackError::Eof);
        }
        let first = buf[0];
        if first & 0x80 != 0 {
            let (v, n) = read_prefixed_int(buf, 7)?;
            Ok((Acknowledgment::HeaderBlock { stream_id: v }, n))
        } else if first & 0x40 != 0 {
            let (v, n) = read_prefixed_int(buf, 6)?;
            Ok((Acknowledgment::StreamCancel { stream_id: v }, n))
        } else {
            let (v, n) = read_prefixed_int(buf, 6)?;
            Ok((Acknowledgment::TableSynchronize { increment: v }, n))
        }
    }
}

/// Reconstructs `largest_reference` from the wire-encoded value per RFC 9204
/// §4.5.1.2 / Appendix C, not the divergent constant some reference ports
/// use — see DESIGN.md.
pub fn decode_largest_reference(encoded: u64, insert_count: u64, max_entries: u64) -> QpackResult<u64> {
    if encoded == 0 {
        return Ok(0);
    }
    if max_entries == 0 {
        return Err(QpackError::IndexError);
    }
    let full_range = 2 * max_entries;
    if encoded > full_range {
        return Err(QpackError::IndexError);
    }
    let max_value = insert_count + max_entries;
    let max_wrapped = (max_value / full_range) * full_range;
    let mut req = max_wrapped + encoded - 1;
    if req > max_value {
        if req < full_range {
            return Err(QpackError::IndexError);
        }
        req -= full_range;
    }
    if req == 0 {
        return Err(QpackError::IndexError);
    }
    Ok(req)
}

/// The encoder-side counterpart of [`decode_largest_reference`]: picks the
/// wire value that decodes back to `largest_reference` given the same
/// `max_entries`.
pub fn encode_largest_reference(largest_reference: u64, max_entries: u64) -> u64 {
    if largest_reference == 0 {
        0
    } else {
        largest_reference % (2 * max_entries) + 1
    }
}

struct ParsedPrefix {
    largest_reference: u64,
    base: u64,
}

fn parse_block_prefix(buf: &[u8], insert_count: u64, max_entries: u64) -> QpackResult<(ParsedPrefix, usize)> {
    let (encoded_largest, n1) = read_prefixed_int(buf, 8)?;
    let rest = &buf[n1..];
    if rest.is_empty() {
        return Err(QpackError::Eof);
    }
    let sign = (rest[0] & 0x80) != 0;
    let (delta, n2) = read_prefixed_int(rest, 7)?;
    let largest_reference = decode_largest_reference(encoded_largest, insert_count, max_entries)?;
    if sign && delta == 0 {
        return Err(QpackError::InvalidBase);
    }
    let base = if sign {
        largest_reference.checked_sub(delta).ok_or(QpackError::InvalidBase)?
    } else {
        largest_reference + delta
    };
    Ok((ParsedPrefix { largest_reference, base }, n1 + n2))
}

/// The decoding half of a connection. Cheap to share across threads by
/// reference: the dynamic table is internally synchronized, and the
/// acknowledgment channel is a plain MPSC queue.
pub struct Decoder {
    table: DecoderTable,
    ack_tx: Sender<Acknowledgment>,
    ack_rx: Receiver<Acknowledgment>,
    last_synced_insert_count: AtomicU64,
    ack_delay: Duration,
    cancelled_streams: Mutex<HashSet<u64>>,
}

impl Decoder {
    pub fn new(capacity: usize, ack_delay: Duration) -> Decoder {
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
        Decoder {
            table: DecoderTable::new(capacity),
            ack_tx,
            ack_rx,
            last_synced_insert_count: AtomicU64::new(0),
            ack_delay,
            cancelled_streams: Mutex::new(HashSet::new()),
        }
    }

    fn max_entries(&self) -> u64 {
        (self.table.capacity() / 32) as u64
    }

    /// Consumes encoder instructions from `buf` (the full, currently
    /// available contents of the encoder-instruction stream) until it is
    /// exhausted. Each successful table mutation wakes any thread blocked
    /// in [`Decoder::read_header_block`].
    pub fn service_updates(&self, mut buf: &[u8]) -> QpackResult<()> {
        while !buf.is_empty() {
            let first = buf[0];
            let consumed = if first & 0x80 != 0 {
                self.apply_insert_with_name_reference(buf)?
            } else if first & 0x40 != 0 {
                self.apply_insert_with_literal_name(buf)?
            } else if first & 0x20 != 0 {
                self.apply_set_capacity(buf)?
            } else {
                self.apply_duplicate(buf)?
            };
            buf = &buf[consumed..];
        }
        Ok(())
    }

    fn apply_insert_with_name_reference(&self, buf: &[u8]) -> QpackResult<usize> {
        let is_static = buf[0] & 0x40 != 0;
        let (name_index, idx_len) = read_prefixed_int(buf, 6)?;
        let name = if is_static {
            static_table::get(name_index as usize)
                .ok_or(QpackError::IndexError)?
                .0
                .into()
        } else {
            let base = resolve_relative_to_current(&self.table, name_index)?;
            self.table.get_by_base(base)?.0
        };
        let (value_bytes, val_len) = read_string(&buf[idx_len..], 8)?;
        self.table.insert(name, FieldValue::from(value_bytes))?;
        Ok(idx_len + val_len)
    }

    fn apply_insert_with_literal_name(&self, buf: &[u8]) -> QpackResult<usize> {
        let (name_bytes, name_len) = read_string(buf, 6)?;
        let (value_bytes, val_len) = read_string(&buf[name_len..], 8)?;
        self.table
            .insert(FieldName::from(name_bytes), FieldValue::from(value_bytes))?;
        Ok(name_len + val_len)
    }

    fn apply_set_capacity(&self, buf: &[u8]) -> QpackResult<usize> {
        let (capacity, n) = read_prefixed_int(buf, 5)?;
        self.table.set_capacity(capacity as usize)?;
        Ok(n)
    }

    fn apply_duplicate(&self, buf: &[u8]) -> QpackResult<usize> {
        let (relative, n) = read_prefixed_int(buf, 5)?;
        self.table.duplicate(relative)?;
        Ok(n)
    }

    /// Reads one header block (the full payload of a HEADERS or
    /// PUSH_PROMISE frame) from `stream_id`. Blocks the calling thread
    /// until the dynamic table has advanced far enough to resolve every
    /// reference inside it.
    pub fn read_header_block(&self, stream_id: u64, block: &[u8]) -> QpackResult<HeaderList> {
        let max_entries = self.max_entries();
        let (prefix, prefix_len) = parse_block_prefix(block, self.table.insert_count(), max_entries)?;

        if prefix.largest_reference > 0 {
            self.table.wait_for_insert_count(prefix.largest_reference);
        }

        let mut pinned = HashSet::new();
        let result = self.decode_instructions(&block[prefix_len..], prefix.base, &mut pinned);

        for base in &pinned {
            self.table.unpin(*base);
        }

        let fields = result?;

        if prefix.largest_reference > 0 {
            self.ack_tx
                .send(Acknowledgment::HeaderBlock { stream_id })
                .map_err(|_| QpackError::InvalidFrame)?;
        }
        Ok(fields)
    }

    fn decode_instructions(
        &self,
        mut buf: &[u8],
        base: u64,
        pinned: &mut HashSet<u64>,
    ) -> QpackResult<HeaderList> {
        let mut fields = HeaderList::new();
        let mut seen_regular_field = false;
        while !buf.is_empty() {
            let first = buf[0];
            let (field, consumed) = if first & 0x80 != 0 {
                self.decode_indexed(buf, base, pinned)?
            } else if first & 0x40 != 0 {
                self.decode_literal_with_name_reference(buf, base, pinned)?
            } else if first & 0x20 != 0 {
                self.decode_literal_with_literal_name(buf)?
            } else if first & 0x10 != 0 {
                self.decode_post_base_indexed(buf, base, pinned)?
            } else {
                self.decode_literal_with_post_base_name(buf, base, pinned)?
            };
            if field.name.is_pseudo() {
                if seen_regular_field {
                    return Err(QpackError::PseudoHeaderOrdering);
                }
            } else {
                seen_regular_field = true;
            }
            fields.push(field);
            buf = &buf[consumed..];
        }
        Ok(fields)
    }

    fn decode_indexed(
        &self,
        buf: &[u8],
        base: u64,
        pinned: &mut HashSet<u64>,
    ) -> QpackResult<(HeaderField, usize)> {
        let is_static = buf[0] & 0x40 != 0;
        let (index, n) = read_prefixed_int(buf, 6)?;
        let (name, value) = self.lookup_indexed(is_static, base, index, pinned)?;
        Ok((HeaderField::new(name, value), n))
    }

    fn decode_literal_with_name_reference(
        &self,
        buf: &[u8],
        base: u64,
        pinned: &mut HashSet<u64>,
    ) -> QpackResult<(HeaderField, usize)> {
        let never_index = buf[0] & 0x20 != 0;
        let is_static = buf[0] & 0x10 != 0;
        let (index, n1) = read_prefixed_int(buf, 4)?;
        let (name, _) = self.lookup_indexed(is_static, base, index, pinned)?;
        let (value_bytes, n2) = read_string(&buf[n1..], 8)?;
        let field = if never_index {
            HeaderField::sensitive(name, FieldValue::from(value_bytes))
        } else {
            HeaderField::new(name, FieldValue::from(value_bytes))
        };
        Ok((field, n1 + n2))
    }

    fn decode_literal_with_literal_name(&self, buf: &[u8]) -> QpackResult<(HeaderField, usize)> {
        let never_index = buf[0] & 0x10 != 0;
        let (name_bytes, n1) = read_string(buf, 4)?;
        let (value_bytes, n2) = read_string(&buf[n1..], 8)?;
        let field = if never_index {
            HeaderField::sensitive(FieldName::from(name_bytes), FieldValue::from(value_bytes))
        } else {
            HeaderField::new(FieldName::from(name_bytes), FieldValue::from(value_bytes))
        };
        Ok((field, n1 + n2))
    }

    fn decode_post_base_indexed(
        &self,
        buf: &[u8],
        base: u64,
        pinned: &mut HashSet<u64>,
    ) -> QpackResult<(HeaderField, usize)> {
        let (offset, n) = read_prefixed_int(buf, 4)?;
        let entry_base = resolve_post_base(base, offset);
        self.table.pin(entry_base);
        pinned.insert(entry_base);
        let (name, value) = self.table.get_by_base(entry_base)?;
        Ok((HeaderField::new(name, value), n))
    }

    fn decode_literal_with_post_base_name(
        &self,
        buf: &[u8],
        base: u64,
        pinned: &mut HashSet<u64>,
    ) -> QpackResult<(HeaderField, usize)> {
        let never_index = buf[0] & 0x08 != 0;
        let (offset, n1) = read_prefixed_int(buf, 3)?;
        let entry_base = resolve_post_base(base, offset);
        self.table.pin(entry_base);
        pinned.insert(entry_base);
        let (name, _) = self.table.get_by_base(entry_base)?;
        let (value_bytes, n2) = read_string(&buf[n1..], 8)?;
        let field = if never_index {
            HeaderField::sensitive(name, FieldValue::from(value_bytes))
        } else {
            HeaderField::new(name, FieldValue::from(value_bytes))
        };
        Ok((field, n1 + n2))
    }

    fn lookup_indexed(
        &self,
        is_static: bool,
        block_base: u64,
        index: u64,
        pinned: &mut HashSet<u64>,
    ) -> QpackResult<(FieldName, FieldValue)> {
        if is_static {
            let (name, value) = static_table::get(index as usize).ok_or(QpackError::IndexError)?;
            Ok((FieldName::from(name), FieldValue::from(value)))
        } else {
            let entry_base = resolve_relative(block_base, index).ok_or(QpackError::IndexError)?;
            self.table.pin(entry_base);
            pinned.insert(entry_base);
            self.table.get_by_base(entry_base)
        }
    }

    /// Called when the transport reports a request stream was reset while
    /// a `read_header_block` call for it might be blocked or in flight.
    pub fn cancel_stream(&self, stream_id: u64) -> QpackResult<()> {
        self.cancelled_streams.lock().insert(stream_id);
        self.ack_tx
            .send(Acknowledgment::StreamCancel { stream_id })
            .map_err(|_| QpackError::InvalidFrame)
    }

    pub fn is_cancelled(&self, stream_id: u64) -> bool {
        self.cancelled_streams.lock().contains(&stream_id)
    }

    /// The single producer for the acknowledgment stream: drains queued
    /// header-block and stream-cancel acknowledgments, and coalesces
    /// table-advance notifications behind `ack_delay`. Runs until the
    /// channel disconnects; a write failure is fatal and propagated.
    pub fn service_acknowledgments(&self, mut write: impl FnMut(&[u8]) -> QpackResult<()>) -> QpackResult<()> {
        loop {
            match self.ack_rx.recv_timeout(self.ack_delay) {
                Ok(ack) => {
                    let mut out = Vec::new();
                    ack.encode(&mut out);
                    write(&out)?;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    let current = self.table.insert_count();
                    let last = self.last_synced_insert_count.load(Ordering::Acquire);
                    if current > last {
                        self.last_synced_insert_count.store(current, Ordering::Release);
                        let mut out = Vec::new();
                        Acknowledgment::TableSynchronize {
                            increment: current - last,
                        }
                        .encode(&mut out);
                        write(&out)?;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    trace!("decoder acknowledgment channel closed");
                    return Ok(());
                }
            }
        }
    }
}

fn resolve_relative_to_current(table: &DecoderTable, relative: u64) -> QpackResult<u64> {
    crate::table::dynamic::resolve_relative_to_insert_count(table.insert_count(), relative)
        .ok_or(QpackError::IndexError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn largest_reference_zero_means_no_dynamic_reference() {
        assert_eq!(decode_largest_reference(0, 100, 8).unwrap(), 0);
    }

    #[test]
    fn largest_reference_encode_decode_round_trip() {
        // Matches the worked example: largest_reference=1, insert_count=0, max_entries=8.
        let encoded = encode_largest_reference(1, 8);
        assert_eq!(encoded, 2);
        assert_eq!(decode_largest_reference(encoded, 0, 8).unwrap(), 1);
    }

    #[test]
    fn sign_delta_illegality_is_rejected() {
        // largest-reference = 1 (encoded 2, with insert_count=1, max_entries=8),
        // then sign bit 1 with delta 0 -- the illegal (negative, 0) encoding.
        let mut prefix_buf = Vec::new();
        crate::wire::write_prefixed_int(&mut prefix_buf, 8, 0, 2);
        crate::wire::write_prefixed_int(&mut prefix_buf, 7, 0x80, 0);
        let result = parse_block_prefix(&prefix_buf, 1, 8);
        assert_eq!(result.unwrap_err(), QpackError::InvalidBase);
    }

    #[test]
    fn blocking_decode_resumes_after_insert() {
        let decoder = Arc::new(Decoder::new(256, StdDuration::from_millis(50)));
        // Block prefix referencing largest_reference = 1 before any insert exists.
        let mut block = Vec::new();
        // With insert_count=0, max_entries=256/32=8; encoded value for req=1:
        // full_range=16, max_value=0+8=8, max_wrapped=0, req=encoded-1 => encoded=2.
        crate::wire::write_prefixed_int(&mut block, 8, 0, 2);
        crate::wire::write_prefixed_int(&mut block, 7, 0, 0); // sign 0, delta 0 -> base = 1
        crate::wire::write_prefixed_int(&mut block, 6, 0x80, 0); // indexed dynamic, relative 0

        let reader_decoder = Arc::clone(&decoder);
        let handle = thread::spawn(move || reader_decoder.read_header_block(4, &block));

        thread::sleep(StdDuration::from_millis(20));
        // Build an insert-with-literal-name instruction for name "k", value "v".
        let mut name_part = Vec::new();
        crate::wire::write_string(&mut name_part, 6, 0x40, HuffmanPolicy::Never, b"k");
        let mut value_part = Vec::new();
        crate::wire::write_string(&mut value_part, 8, 0, HuffmanPolicy::Never, b"v");
        let mut full = name_part;
        full.extend_from_slice(&value_part);
        decoder.service_updates(&full).unwrap();

        let fields = handle.join().unwrap().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name.as_bytes(), b"k");
        assert_eq!(fields[0].value.as_bytes(), b"v");
    }
}
