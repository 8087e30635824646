// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Variable-length integers and the typed/flagged frame layer that the
//! control, request, and push streams of a connection are built from.

use bitflags::bitflags;

use crate::error::{QpackError, QpackResult};

pub const MAX_VARINT: u64 = (1u64 << 62) - 1;

bitflags! {
    /// No frame type defined in this crate currently assigns meaning to any
    /// bit; the byte is still carried on the wire so a future frame type
    /// can claim one without a format change.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
    }
}

/// Writes `value` as a QUIC-style variable-length integer: the top two
/// bits of the leading octet select a length class of 1, 2, 4, or 8 octets.
pub fn write_varint(out: &mut Vec<u8>, value: u64) -> QpackResult<()> {
    if value > MAX_VARINT {
        return Err(QpackError::VarintTooLarge);
    }
    if value <= 0x3f {
        out.push(value as u8);
    } else if value <= 0x3fff {
        let v = value as u16 | 0x4000;
        out.extend_from_slice(&v.to_be_bytes());
    } else if value <= 0x3fff_ffff {
        let v = value as u32 | 0x8000_0000;
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        let v = value | 0xc000_0000_0000_0000;
        out.extend_from_slice(&v.to_be_bytes());
    }
    Ok(())
}

/// Reads a variable-length integer from the start of `buf`. Returns the
/// value and the number of bytes consumed.
pub fn read_varint(buf: &[u8]) -> QpackResult<(u64, usize)> {
    let first = *buf.first().ok_or(QpackError::Eof)?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return Err(QpackError::Eof);
    }
    let mut value = (first & 0x3f) as u64;
    for &b in &buf[1..len] {
        value = (value << 8) | b as u64;
    }
    Ok((value, len))
}

/// Identifiers for the frame types defined for HTTP/3 streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Data,
    Headers,
    Priority,
    CancelPush,
    Settings,
    PushPromise,
    GoAway,
    MaxPushId,
    Unknown(u64),
}

impl Kind {
    pub fn from_id(id: u64) -> Kind {
        match id {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::CancelPush,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            7 => Kind::GoAway,
            13 => Kind::MaxPushId,
            other => Kind::Unknown(other),
        }
    }

    pub fn id(self) -> u64 {
        match self {
            Kind::Data => 0,
            Kind::Headers => 1,
            Kind::Priority => 2,
            Kind::CancelPush => 3,
            Kind::Settings => 4,
            Kind::PushPromise => 5,
            Kind::GoAway => 7,
            Kind::MaxPushId => 13,
            Kind::Unknown(id) => id,
        }
    }
}

/// Which kind of stream a frame was read from — request-stream frames
/// reject unknown types, control-stream frames hand them to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Control,
    Request,
}

/// A decoded frame: type, flags, and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: Kind,
    pub flags: Flags,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: Kind, payload: Vec<u8>) -> Frame {
        Frame {
            kind,
            flags: Flags::empty(),
            payload,
        }
    }

    /// Encodes `varint(length) || u8(type) || u8(flags) || payload`.
    pub fn encode(&self, out: &mut Vec<u8>) -> QpackResult<()> {
        let type_id: u8 = self
            .kind
            .id()
            .try_into()
            .map_err(|_| QpackError::InvalidFrame)?;
        write_varint(out, self.payload.len() as u64)?;
        out.push(type_id);
        out.push(self.flags.bits());
        out.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Parses one frame from the start of `buf`, honoring the rule that
    /// unknown frame types are only permitted on control streams. Returns
    /// the frame and the number of bytes consumed.
    pub fn parse(buf: &[u8], role: StreamRole) -> QpackResult<(Frame, usize)> {
        let (len, len_len) = read_varint(buf)?;
        let rest = &buf[len_len..];
        let &[type_id, flags_byte, ..] = rest else {
            return Err(QpackError::Eof);
        };
        let header_len = len_len + 2;
        let len = len as usize;
        let end = header_len.checked_add(len).ok_or(QpackError::InvalidFrame)?;
        if end > buf.len() {
            return Err(QpackError::Eof);
        }
        let kind = Kind::from_id(type_id as u64);
        if matches!(kind, Kind::Unknown(_)) && role == StreamRole::Request {
            return Err(QpackError::UnsupportedFrame);
        }
        let payload = buf[header_len..end].to_vec();
        Ok((
            Frame {
                kind,
                flags: Flags::from_bits_retain(flags_byte),
                payload,
            },
            end,
        ))
    }
}

/// The settings a peer may advertise on the control stream. Unrecognized
/// options are ignored on receipt, not rejected.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Settings {
    dynamic_table_capacity: Option<u64>,
    max_header_list_size: Option<u64>,
    max_blocked_streams: Option<u64>,
}

const SETTING_QPACK_MAX_TABLE_CAPACITY: u64 = 1;
const SETTING_MAX_HEADER_LIST_SIZE: u64 = 6;
const SETTING_QPACK_BLOCKED_STREAMS: u64 = 7;

impl Settings {
    pub fn dynamic_table_capacity(&self) -> Option<u64> {
        self.dynamic_table_capacity
    }

    pub fn set_dynamic_table_capacity(&mut self, value: u64) -> QpackResult<()> {
        if value >= (1 << 30) {
            return Err(QpackError::InvalidFrame);
        }
        self.dynamic_table_capacity = Some(value);
        Ok(())
    }

    pub fn max_header_list_size(&self) -> Option<u64> {
        self.max_header_list_size
    }

    pub fn set_max_header_list_size(&mut self, value: u64) {
        self.max_header_list_size = Some(value);
    }

    pub fn max_blocked_streams(&self) -> Option<u64> {
        self.max_blocked_streams
    }

    pub fn set_max_blocked_streams(&mut self, value: u64) -> QpackResult<()> {
        if value >= (1 << 16) {
            return Err(QpackError::InvalidFrame);
        }
        self.max_blocked_streams = Some(value);
        Ok(())
    }

    pub fn encode(&self) -> QpackResult<Frame> {
        let mut payload = Vec::new();
        if let Some(v) = self.dynamic_table_capacity {
            write_varint(&mut payload, SETTING_QPACK_MAX_TABLE_CAPACITY)?;
            write_varint(&mut payload, v)?;
        }
        if let Some(v) = self.max_header_list_size {
            write_varint(&mut payload, SETTING_MAX_HEADER_LIST_SIZE)?;
            write_varint(&mut payload, v)?;
        }
        if let Some(v) = self.max_blocked_streams {
            write_varint(&mut payload, SETTING_QPACK_BLOCKED_STREAMS)?;
            write_varint(&mut payload, v)?;
        }
        Ok(Frame::new(Kind::Settings, payload))
    }

    pub fn parse(frame: &Frame) -> QpackResult<Settings> {
        if frame.kind != Kind::Settings {
            return Err(QpackError::InvalidFrame);
        }
        let mut settings = Settings::default();
        let mut rest = &frame.payload[..];
        while !rest.is_empty() {
            let (id, id_len) = read_varint(rest)?;
            let (val, val_len) = read_varint(&rest[id_len..])?;
            rest = &rest[id_len + val_len..];
            match id {
                SETTING_QPACK_MAX_TABLE_CAPACITY => settings.dynamic_table_capacity = Some(val),
                SETTING_MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(val),
                SETTING_QPACK_BLOCKED_STREAMS => settings.max_blocked_streams = Some(val),
                _ => {}
            }
        }
        Ok(settings)
    }
}
