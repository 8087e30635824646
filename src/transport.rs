// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An in-memory duplex byte pipe implementing [`crate::connection`]'s
//! stream traits, so encoder/decoder pairs can be driven end-to-end in
//! tests without a real QUIC stack.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::connection::{BidiStream, RecvStream, SendStream};
use crate::error::{QpackError, QpackResult};

struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
    reset: Option<u64>,
}

struct Pipe {
    id: u64,
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn new(id: u64) -> Pipe {
        Pipe {
            id,
            state: Mutex::new(PipeState {
                buf: VecDeque::new(),
                closed: false,
                reset: None,
            }),
            ready: Condvar::new(),
        }
    }
}

/// The write half of an in-memory pipe.
#[derive(Clone)]
pub struct PipeSender {
    inner: Arc<Pipe>,
}

/// The read half of an in-memory pipe.
#[derive(Clone)]
pub struct PipeReceiver {
    inner: Arc<Pipe>,
}

impl SendStream for PipeSender {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn write(&self, data: &[u8]) -> QpackResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(QpackError::InvalidFrame);
        }
        state.buf.extend(data.iter().copied());
        self.inner.ready.notify_all();
        Ok(())
    }

    fn close(&self) -> QpackResult<()> {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.ready.notify_all();
        Ok(())
    }

    fn reset(&self, error_code: u64) -> QpackResult<()> {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.reset = Some(error_code);
        self.inner.ready.notify_all();
        Ok(())
    }
}

impl RecvStream for PipeReceiver {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn read(&self, buf: &mut [u8]) -> QpackResult<usize> {
        let mut state = self.inner.state.lock();
        loop {
            if state.reset.is_some() {
                return Err(QpackError::InvalidFrame);
            }
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.buf.pop_front().unwrap();
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            self.inner.ready.wait(&mut state);
        }
    }

    fn stop_sending(&self, _error_code: u64) -> QpackResult<()> {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.ready.notify_all();
        Ok(())
    }
}

/// One side of a bidirectional in-memory pipe: writes go to the peer's
/// receive half, reads come from the peer's send half.
pub struct PipeDuplex {
    id: u64,
    send: PipeSender,
    recv: PipeReceiver,
}

impl SendStream for PipeDuplex {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, data: &[u8]) -> QpackResult<()> {
        self.send.write(data)
    }

    fn close(&self) -> QpackResult<()> {
        self.send.close()
    }

    fn reset(&self, error_code: u64) -> QpackResult<()> {
        self.send.reset(error_code)
    }
}

impl RecvStream for PipeDuplex {
    fn id(&self) -> u64 {
        self.id
    }

    fn read(&self, buf: &mut [u8]) -> QpackResult<usize> {
        self.recv.read(buf)
    }

    fn stop_sending(&self, error_code: u64) -> QpackResult<()> {
        self.recv.stop_sending(error_code)
    }
}

impl BidiStream for PipeDuplex {}

/// An in-memory transport test double. Not a [`crate::connection::Connection`]
/// implementation itself (there is no peer to accept remote streams from);
/// it only manufactures the paired stream handles that test code wires
/// directly into two [`crate::connection::Session`]s.
pub struct InMemoryPipe;

impl InMemoryPipe {
    /// Builds one unidirectional stream: a sender this end writes to, and a
    /// receiver the simulated peer reads from.
    pub fn unidirectional(id: u64) -> (PipeSender, PipeReceiver) {
        let inner = Arc::new(Pipe::new(id));
        (
            PipeSender { inner: inner.clone() },
            PipeReceiver { inner },
        )
    }

    /// Builds a connected pair of bidirectional streams: writes on one side
    /// are readable on the other.
    pub fn bidirectional_pair(id_a: u64, id_b: u64) -> (PipeDuplex, PipeDuplex) {
        let a_to_b = Arc::new(Pipe::new(id_a));
        let b_to_a = Arc::new(Pipe::new(id_b));
        let a = PipeDuplex {
            id: id_a,
            send: PipeSender { inner: a_to_b.clone() },
            recv: PipeReceiver { inner: b_to_a.clone() },
        };
        let b = PipeDuplex {
            id: id_b,
            send: PipeSender { inner: b_to_a },
            recv: PipeReceiver { inner: a_to_b },
        };
        (a, b)
    }
}
