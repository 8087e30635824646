// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

/// A header field name, stored as raw octets rather than `String` so that
/// malformed-but-wire-valid names round-trip without a UTF-8 check on the
/// hot path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldName(Vec<u8>);

impl FieldName {
    pub fn from_static(name: &'static str) -> FieldName {
        FieldName(name.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bytes_len(&self) -> usize {
        self.0.len()
    }

    pub fn is_pseudo(&self) -> bool {
        self.0.first() == Some(&b':')
    }
}

impl From<&str> for FieldName {
    fn from(value: &str) -> Self {
        FieldName(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for FieldName {
    fn from(value: &[u8]) -> Self {
        FieldName(value.to_vec())
    }
}

impl From<Vec<u8>> for FieldName {
    fn from(value: Vec<u8>) -> Self {
        FieldName(value)
    }
}

impl fmt::Debug for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// A header field value. Same rationale as [`FieldName`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldValue(Vec<u8>);

impl FieldValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bytes_len(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue(value.to_vec())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue(value)
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// A single name/value pair plus the never-index bit a sender attaches to
/// sensitive fields (credentials, cookies) so that neither endpoint ever
/// places it in the dynamic table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderField {
    pub name: FieldName,
    pub value: FieldValue,
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new<N, V>(name: N, value: V) -> HeaderField
    where
        N: Into<FieldName>,
        V: Into<FieldValue>,
    {
        HeaderField {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive<N, V>(name: N, value: V) -> HeaderField
    where
        N: Into<FieldName>,
        V: Into<FieldValue>,
    {
        HeaderField {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }

    /// `name.len + value.len + 32`, the size an entry occupies in the
    /// dynamic table regardless of whether it is ever inserted.
    pub fn table_size(&self) -> usize {
        self.name.bytes_len() + self.value.bytes_len() + 32
    }
}

/// An ordered header list, i.e. the thing a single header block encodes.
/// Order and duplicate names both matter (`set-cookie`, pseudo-headers),
/// so this is a plain `Vec`, not a map.
pub type HeaderList = Vec<HeaderField>;

/// Field names that are never placed in the dynamic table by default,
/// because doing so is either useless (high cardinality, single-use
/// values) or actively harmful (values that should not be cached across
/// requests). Callers can still override this via
/// `Encoder::set_index_preference`.
pub const NEVER_INDEX_DEFAULTS: &[&str] = &[
    ":path",
    "content-length",
    "content-range",
    "date",
    "expires",
    "etag",
    "if-modified-since",
    "if-range",
    "if-unmodified-since",
    "last-modified",
    "link",
    "range",
    "referer",
    "refresh",
];

pub fn is_never_index_default(name: &FieldName) -> bool {
    NEVER_INDEX_DEFAULTS
        .iter()
        .any(|n| n.as_bytes() == name.as_bytes())
}
