// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// The byte pipe underneath a connection.
///
/// Every call is non-blocking: an empty socket answers `WouldBlock`. Methods
/// take `&self` because the read side and the write side of one connection
/// are driven from different threads.
pub trait Transport: Send + Sync + Debug {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn transmit(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts both directions down. The descriptor itself is released when the
    /// transport is dropped.
    fn close(&self) -> io::Result<()>;

    /// Descriptor the OS readiness backends register. `None` for transports
    /// that only the in-memory backend can drive.
    fn raw_fd(&self) -> Option<RawFd>;
}

impl Transport for TcpStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn transmit(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

#[derive(Debug, Default)]
struct MemoryPipe {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    peer_closed: bool,
    closed: bool,
    write_limit: Option<usize>,
    writes_blocked: bool,
    read_error: Option<ErrorKind>,
    transmit_calls: usize,
    transmit_held: bool,
    transmits_parked: usize,
}

/// In-memory transport for driving connections without sockets.
///
/// Clones share the same pipe, so a test keeps one clone to feed inbound
/// bytes and inspect what the connection transmitted.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    pipe: Arc<Mutex<MemoryPipe>>,
    gate: Arc<Condvar>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes the connection will see on its next reads.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.pipe.lock().inbound.extend(bytes);
    }

    /// Orderly close from the peer: reads return 0 once inbound is drained.
    pub fn close_inbound(&self) {
        self.pipe.lock().peer_closed = true;
    }

    /// Makes the next read fail with `kind`.
    pub fn fail_next_read(&self, kind: ErrorKind) {
        self.pipe.lock().read_error = Some(kind);
    }

    /// Caps how many bytes one transmit call accepts.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.pipe.lock().write_limit = limit;
    }

    /// While blocked, transmit answers `WouldBlock`.
    pub fn block_writes(&self, blocked: bool) {
        self.pipe.lock().writes_blocked = blocked;
    }

    /// While held, transmit calls park inside the transport, like a slow
    /// syscall, until released.
    pub fn hold_transmit(&self, held: bool) {
        self.pipe.lock().transmit_held = held;
        self.gate.notify_all();
    }

    /// Transmit calls currently parked by [`MemoryTransport::hold_transmit`].
    pub fn transmits_parked(&self) -> usize {
        self.pipe.lock().transmits_parked
    }

    pub fn written(&self) -> Vec<u8> {
        self.pipe.lock().outbound.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.lock().outbound)
    }

    pub fn transmit_calls(&self) -> usize {
        self.pipe.lock().transmit_calls
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.lock().closed
    }
}

impl Transport for MemoryTransport {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock();
        if let Some(kind) = pipe.read_error.take() {
            return Err(io::Error::from(kind));
        }
        if pipe.closed {
            return Ok(0);
        }
        if pipe.inbound.is_empty() {
            return if pipe.peer_closed {
                Ok(0)
            } else {
                Err(io::Error::from(ErrorKind::WouldBlock))
            };
        }
        let len = buf.len().min(pipe.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.inbound.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }

    fn transmit(&self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.lock();
        while pipe.transmit_held {
            pipe.transmits_parked += 1;
            self.gate.wait(&mut pipe);
            pipe.transmits_parked -= 1;
        }
        if pipe.closed {
            return Err(io::Error::from(ErrorKind::BrokenPipe));
        }
        if pipe.writes_blocked {
            return Err(io::Error::from(ErrorKind::WouldBlock));
        }
        pipe.transmit_calls += 1;
        let len = pipe.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        pipe.outbound.extend_from_slice(&buf[..len]);
        Ok(len)
    }

    fn close(&self) -> io::Result<()> {
        self.pipe.lock().closed = true;
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}
