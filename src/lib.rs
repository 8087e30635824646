// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A QPACK (RFC 9204) header-compression engine and the HTTP/3 frame
//! layer it rides on: bit/Huffman codecs, static and dynamic tables,
//! encoder and decoder, varint framing, and the connection glue that
//! wires them to a transport.
//!
//! Out of scope: TLS, congestion control, loss recovery, connection
//! migration, and HTTP semantics beyond header/trailer/push-promise
//! framing. HPACK (`hpack`) is retained only as a second, independently
//! specified wire format for cross-checking the bit/Huffman primitives
//! this crate shares between the two compression schemes.

pub mod bits;
pub mod huffman;
pub mod error;
pub mod header;
pub mod wire;
pub mod table;
pub mod framing;
pub mod decoder;
pub mod encoder;
pub mod connection;
pub mod hpack;

#[cfg(any(test, feature = "testing"))]
pub mod transport;

pub use bits::{BitReader, BitWriter};
pub use connection::{Config, Connection, Session};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{QpackError, QpackResult};
pub use framing::{Flags, Frame, Kind, Settings, StreamRole};
pub use header::{FieldName, FieldValue, HeaderField, HeaderList};
