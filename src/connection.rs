// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transport-facing glue: the stream/connection traits a real QUIC stack
//! would implement, the three-stream handshake each peer performs at
//! connection start, and the `Config` that seeds the initial `SETTINGS`
//! frame.

use std::time::Duration;

use log::{debug, warn};

use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{QpackError, QpackResult};
use crate::framing::{Flags, Frame, Settings, StreamRole};

/// Stream type octet sent as the first byte of each unidirectional stream
/// (HTTP/3 §3.2). Only the three this crate cares about are named.
pub const STREAM_TYPE_CONTROL: u64 = 0x00;
pub const STREAM_TYPE_QPACK_ENCODER: u64 = 0x02;
pub const STREAM_TYPE_QPACK_DECODER: u64 = 0x03;

/// A send-only byte stream: ordered, reliable, with an immutable identifier.
pub trait SendStream {
    fn id(&self) -> u64;
    fn write(&self, data: &[u8]) -> QpackResult<()>;
    fn close(&self) -> QpackResult<()>;
    fn reset(&self, error_code: u64) -> QpackResult<()>;
}

/// A receive-only byte stream.
pub trait RecvStream {
    fn id(&self) -> u64;
    /// Reads into `buf`, returning the number of bytes actually read. Zero
    /// means the peer closed its send side; blocks if no data is available
    /// and the stream is still open.
    fn read(&self, buf: &mut [u8]) -> QpackResult<usize>;
    fn stop_sending(&self, error_code: u64) -> QpackResult<()>;
}

/// A bidirectional stream, e.g. a request stream.
pub trait BidiStream: SendStream + RecvStream {}

/// Lifecycle state of a connection, as exposed by `Connection::get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// The connection-level operations this crate consumes from its transport
/// collaborator. Implementations own stream creation and acceptance;
/// everything above this trait is transport-agnostic.
pub trait Connection {
    type Bidi: BidiStream;
    type Send: SendStream;
    type Recv: RecvStream;

    fn create_stream(&self) -> QpackResult<Self::Bidi>;
    fn create_send_stream(&self) -> QpackResult<Self::Send>;
    fn remote_streams(&self) -> crossbeam_channel::Receiver<Self::Bidi>;
    fn remote_recv_streams(&self) -> crossbeam_channel::Receiver<Self::Recv>;
    fn get_state(&self) -> ConnectionState;
    fn close(&self, error_code: u64) -> QpackResult<()>;
}

/// Recognized settings exchanged between endpoints at connection start.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Initial capacity advertised for this endpoint's decoder.
    pub decoder_table_capacity: u64,
    /// Advertised concurrent-blocking budget (max blocked streams).
    pub concurrent_decoders: u64,
    /// HTTP-layer option; accepted for parity with the configuration table
    /// but not consumed by anything in this crate.
    pub max_concurrent_pushes: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            decoder_table_capacity: 4096,
            concurrent_decoders: 16,
            max_concurrent_pushes: 0,
        }
    }
}

impl Config {
    pub fn settings(&self) -> QpackResult<Settings> {
        let mut settings = Settings::default();
        settings.set_dynamic_table_capacity(self.decoder_table_capacity)?;
        settings.set_max_blocked_streams(self.concurrent_decoders)?;
        Ok(settings)
    }
}

/// Writes a unidirectional stream's leading type octet.
pub fn write_stream_type(out: &mut Vec<u8>, stream_type: u64) -> QpackResult<()> {
    crate::framing::write_varint(out, stream_type)
}

/// One endpoint's half of a QPACK-over-HTTP/3 session: its own encoder and
/// decoder, plus the three send streams it owns. Does not own the transport
/// connection itself, only the streams handed to it at construction.
pub struct Session<C, E, D>
where
    C: SendStream,
    E: SendStream,
    D: SendStream,
{
    control_send: C,
    encoder_send: E,
    decoder_send: D,
    pub encoder: Encoder,
    pub decoder: Decoder,
}

impl<C, E, D> Session<C, E, D>
where
    C: SendStream,
    E: SendStream,
    D: SendStream,
{
    /// Opens the three unidirectional send streams with their type octets
    /// and emits the initial `SETTINGS` frame on the control stream.
    pub fn start(
        control_send: C,
        encoder_send: E,
        decoder_send: D,
        config: Config,
        sync_delay: Duration,
    ) -> QpackResult<Session<C, E, D>> {
        let mut control_header = Vec::new();
        write_stream_type(&mut control_header, STREAM_TYPE_CONTROL)?;
        control_send.write(&control_header)?;

        let mut encoder_header = Vec::new();
        write_stream_type(&mut encoder_header, STREAM_TYPE_QPACK_ENCODER)?;
        encoder_send.write(&encoder_header)?;

        let mut decoder_header = Vec::new();
        write_stream_type(&mut decoder_header, STREAM_TYPE_QPACK_DECODER)?;
        decoder_send.write(&decoder_header)?;

        let settings_frame = config.settings()?.encode()?;
        let mut settings_bytes = Vec::new();
        settings_frame.encode(&mut settings_bytes)?;
        control_send.write(&settings_bytes)?;

        debug!(
            "session started: decoder_table_capacity={} concurrent_decoders={}",
            config.decoder_table_capacity, config.concurrent_decoders
        );

        let margin = config.decoder_table_capacity as usize;
        Ok(Session {
            control_send,
            encoder_send,
            decoder_send,
            encoder: Encoder::new(
                config.decoder_table_capacity as usize,
                margin,
                config.concurrent_decoders,
            ),
            decoder: Decoder::new(config.decoder_table_capacity as usize, sync_delay),
        })
    }

    /// Applies a peer's `SETTINGS` frame to this session's encoder.
    pub fn apply_peer_settings(&self, frame: &Frame) -> QpackResult<()> {
        let settings = Settings::parse(frame)?;
        if let Some(capacity) = settings.dynamic_table_capacity() {
            self.encoder.set_capacity(
                |instr| self.encoder_send.write(instr),
                capacity as usize,
            )?;
        }
        if let Some(max_blocked) = settings.max_blocked_streams() {
            if let Err(e) = self.encoder.set_max_blocked_streams(max_blocked) {
                warn!("peer advertised an unusable max_blocked_streams: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn write_header_block(
        &self,
        block_writer: impl FnMut(&[u8]) -> QpackResult<()>,
        stream_id: u64,
        headers: &crate::header::HeaderList,
    ) -> QpackResult<()> {
        self.encoder.write_header_block(
            |instr| self.encoder_send.write(instr),
            block_writer,
            stream_id,
            headers,
        )
    }

    /// Applies newly arrived encoder-instruction bytes to this session's
    /// decoder, waking any blocked `read_header_block` call that can now
    /// resolve.
    pub fn service_encoder_instructions(&self, buf: &[u8]) -> QpackResult<()> {
        self.decoder.service_updates(buf)
    }

    /// Applies newly arrived decoder-acknowledgment bytes to this session's
    /// encoder, releasing reference counts and unblocking streams.
    pub fn service_acknowledgments(&self, buf: &[u8]) -> QpackResult<()> {
        self.encoder.service_acknowledgments(buf)
    }

    pub fn read_header_block(&self, stream_id: u64, block: &[u8]) -> QpackResult<crate::header::HeaderList> {
        self.decoder.read_header_block(stream_id, block)
    }

    /// Runs this session's decoder-acknowledgment producer until the
    /// decoder is dropped. Intended to run for the lifetime of the
    /// connection on its own thread; every queued header-block and
    /// stream-cancel acknowledgment, plus periodic table-synchronize
    /// notifications, is written to the decoder-instruction send stream.
    pub fn run_acknowledgment_producer(&self) -> QpackResult<()> {
        self.decoder
            .service_acknowledgments(|ack| self.decoder_send.write(ack))
    }
}

/// Parses the leading type octet of a just-opened unidirectional stream.
pub fn read_stream_type(buf: &[u8]) -> QpackResult<(u64, usize)> {
    crate::framing::read_varint(buf)
}

/// Dispatches a just-parsed control-stream frame, rejecting anything that
/// isn't `SETTINGS` and isn't an unknown (ignorable) type.
pub fn parse_control_frame(buf: &[u8]) -> QpackResult<(Frame, usize)> {
    let (frame, consumed) = Frame::parse(buf, StreamRole::Control)?;
    if frame.flags != Flags::empty() {
        return Err(QpackError::NonZeroFlags);
    }
    Ok((frame, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryPipe;

    #[test]
    fn config_settings_matches_configured_values() {
        let config = Config {
            decoder_table_capacity: 8192,
            concurrent_decoders: 4,
            max_concurrent_pushes: 0,
        };
        let settings = config.settings().unwrap();
        assert_eq!(settings.dynamic_table_capacity(), Some(8192));
        assert_eq!(settings.max_blocked_streams(), Some(4));
    }

    #[test]
    fn session_start_writes_stream_types_and_settings() {
        let (control_send, control_recv) = InMemoryPipe::unidirectional(0);
        let (encoder_send, _encoder_recv) = InMemoryPipe::unidirectional(1);
        let (decoder_send, _decoder_recv) = InMemoryPipe::unidirectional(2);
        let _session = Session::start(
            control_send,
            encoder_send,
            decoder_send,
            Config::default(),
            Duration::from_millis(50),
        )
        .unwrap();

        let mut buf = [0u8; 256];
        let n = control_recv.read(&mut buf).unwrap();
        let (stream_type, consumed) = read_stream_type(&buf[..n]).unwrap();
        assert_eq!(stream_type, STREAM_TYPE_CONTROL);
        let (frame, _) = parse_control_frame(&buf[consumed..n]).unwrap();
        let settings = Settings::parse(&frame).unwrap();
        assert_eq!(settings.dynamic_table_capacity(), Some(4096));
        assert_eq!(settings.max_blocked_streams(), Some(16));
    }

    #[test]
    fn header_block_round_trips_through_sessions() {
        // Each peer's Session owns both an encoder for its own outgoing
        // header blocks and a decoder for header blocks the peer sends it.
        // Here only the "sender" side's encoder and the "receiver" side's
        // decoder are exercised.
        let (control_a_send, _control_a_recv) = InMemoryPipe::unidirectional(0);
        let (encoder_a_send, encoder_a_recv) = InMemoryPipe::unidirectional(1);
        let (decoder_a_send, _decoder_a_recv) = InMemoryPipe::unidirectional(2);
        let sender = Session::start(
            control_a_send,
            encoder_a_send,
            decoder_a_send,
            Config::default(),
            Duration::from_millis(50),
        )
        .unwrap();

        let (control_b_send, _control_b_recv) = InMemoryPipe::unidirectional(3);
        let (encoder_b_send, _encoder_b_recv) = InMemoryPipe::unidirectional(4);
        let (decoder_b_send, _decoder_b_recv) = InMemoryPipe::unidirectional(5);
        let receiver = Session::start(
            control_b_send,
            encoder_b_send,
            decoder_b_send,
            Config::default(),
            Duration::from_millis(50),
        )
        .unwrap();

        // Not in the static table, so the encoder inserts a dynamic entry
        // and emits an instruction before writing the header block.
        let headers: crate::header::HeaderList =
            vec![crate::header::HeaderField::new("x-custom", "value-one")];
        let mut block = Vec::new();
        sender
            .write_header_block(|b| { block.extend_from_slice(b); Ok(()) }, 4, &headers)
            .unwrap();

        let mut instr_buf = [0u8; 256];
        let n = encoder_a_recv.read(&mut instr_buf).unwrap();
        assert!(n > 0, "a dynamic insert must produce an instruction");
        receiver.service_encoder_instructions(&instr_buf[..n]).unwrap();

        let decoded = receiver.read_header_block(4, &block).unwrap();
        assert_eq!(decoded[0].name.as_bytes(), b"x-custom");
        assert_eq!(decoded[0].value.as_bytes(), b"value-one");
    }
}
