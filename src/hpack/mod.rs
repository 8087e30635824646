// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A trimmed HPACK (RFC 7541) surface, kept only as a second, independently
//! specified wire format for cross-checking the bit codec and Huffman codec
//! this crate shares between HPACK and QPACK. There is no dynamic table
//! here and no incremental indexing: just enough of "Literal Header Field
//! without Indexing" (RFC 7541 §6.2.2) to round-trip a header through a
//! format this crate doesn't otherwise speak.

pub mod static_table;

use crate::error::{QpackError, QpackResult};
use crate::wire::{read_prefixed_int, read_string, write_prefixed_int, write_string, HuffmanPolicy};

/// Encodes one field as "Literal Header Field without Indexing": lead byte
/// pattern `0000xxxx`, a 4-bit-prefixed name index (0 meaning "literal name
/// follows"), then a literal value. Uses HPACK's own static table for the
/// name index, not QPACK's.
pub fn encode_literal_without_indexing(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    match static_table::lookup_name(name) {
        Some(index) => write_prefixed_int(out, 4, 0x00, index as u64),
        None => {
            write_prefixed_int(out, 4, 0x00, 0);
            write_string(out, 8, 0, HuffmanPolicy::Auto, name);
        }
    }
    write_string(out, 8, 0, HuffmanPolicy::Auto, value);
}

/// Decodes a field written by [`encode_literal_without_indexing`]. Returns
/// the `(name, value)` pair and the number of input bytes consumed.
pub fn decode_literal_without_indexing(buf: &[u8]) -> QpackResult<((Vec<u8>, Vec<u8>), usize)> {
    let (index, consumed_index) = read_prefixed_int(buf, 4)?;
    let (name, consumed_name) = if index == 0 {
        read_string(&buf[consumed_index..], 8)?
    } else {
        let (name, _) = static_table::get(index as usize).ok_or(QpackError::IndexError)?;
        (name.as_bytes().to_vec(), 0)
    };
    let (value, consumed_value) = read_string(&buf[consumed_index + consumed_name..], 8)?;
    Ok(((name, value), consumed_index + consumed_name + consumed_value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_indexed_name() {
        let mut out = Vec::new();
        encode_literal_without_indexing(&mut out, b":method", b"GET");
        let ((name, value), consumed) = decode_literal_without_indexing(&out).unwrap();
        assert_eq!(name, b":method");
        assert_eq!(value, b"GET");
        assert_eq!(consumed, out.len());
    }

    #[test]
    fn round_trips_literal_name() {
        let mut out = Vec::new();
        encode_literal_without_indexing(&mut out, b"x-custom", b"value-one");
        let ((name, value), _) = decode_literal_without_indexing(&out).unwrap();
        assert_eq!(name, b"x-custom");
        assert_eq!(value, b"value-one");
    }

    #[test]
    fn shares_huffman_table_with_qpack() {
        // The same bytes this crate's own wire layer would produce for a
        // QPACK literal must decode the same way here, since both formats
        // share one Huffman code table.
        let mut qpack_string = Vec::new();
        write_string(&mut qpack_string, 8, 0, HuffmanPolicy::Always, b"www.example.com");
        let (decoded, _) = read_string(&qpack_string, 8).unwrap();
        assert_eq!(decoded, b"www.example.com");
    }
}
