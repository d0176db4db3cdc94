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

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::multiplexer::Interest;
use crate::network::{Frame, FrameDecoder, RingBuffer, Transport};
use crate::{AppError, AppResult};

/// Process-unique id of a connection, also its token in the readiness backend.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

const READ_CHUNK: usize = 16 * 1024;
const MAX_BURST: usize = 64 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Closed,
        }
    }
}

/// Application side of a connection. Called from the worker that owns the
/// connection for the current readiness event.
pub trait PacketHandler: Send + Sync {
    fn on_frame(&self, connection: &Arc<Connection>, frame: Frame);

    fn on_connect(&self, _connection: &Arc<Connection>) {}

    /// Called exactly once, from the teardown path.
    fn on_disconnect(&self, _connection: &Connection) {}
}

/// Builds the connection for an accepted or outbound transport.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        remote: SocketAddr,
    ) -> AppResult<Connection>;
}

/// Factory attaching one shared handler to every connection.
pub struct HandlerFactory<H> {
    handler: Arc<H>,
    read_buffer_size: usize,
    write_buffer_size: usize,
}

impl<H: PacketHandler + 'static> HandlerFactory<H> {
    pub fn new(handler: Arc<H>, read_buffer_size: usize, write_buffer_size: usize) -> Self {
        HandlerFactory {
            handler,
            read_buffer_size,
            write_buffer_size,
        }
    }
}

impl<H: PacketHandler + 'static> ConnectionFactory for HandlerFactory<H> {
    fn create(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        remote: SocketAddr,
    ) -> AppResult<Connection> {
        Ok(Connection::new(
            id,
            transport,
            remote,
            self.handler.clone(),
            self.read_buffer_size,
            self.write_buffer_size,
        ))
    }
}

/// Lets a connection ask its multiplexer for attention from a thread that
/// does not own it.
pub(crate) trait ReadinessNotifier: Send + Sync {
    fn notify_writable(&self, id: ConnectionId);

    fn notify_disconnect(&self, id: ConnectionId);
}

#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl ConnectionStats {
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }
}

enum Burst {
    Drained,
    Pending,
    Failed(AppError),
}

/// Would-block and interrupted calls are retried on the next readiness
/// event; anything else ends the connection.
fn fatal_io(err: io::Error) -> Option<AppError> {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => None,
        _ => Some(AppError::FatalIo(err)),
    }
}

/// Byte-level I/O state for one peer: a read ring buffer the decoder drains
/// and a write ring buffer flushed in bursts.
///
/// `flushing` is the send-lock: only the thread that flips it on transmits,
/// every other `send` just queues. `busy` marks the connection as owned by a
/// worker for the current readiness event; the multiplexer flips it.
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    state: AtomicU8,
    closed: AtomicBool,
    flushing: AtomicBool,
    busy: AtomicBool,
    transport: Box<dyn Transport>,
    read_buffer: Mutex<RingBuffer>,
    write_buffer: Mutex<RingBuffer>,
    arm_lock: Mutex<()>,
    burst_scratch: Mutex<Vec<u8>>,
    notifier: RwLock<Option<Weak<dyn ReadinessNotifier>>>,
    handler: Arc<dyn PacketHandler>,
    stats: ConnectionStats,
    created_at: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("flushing", &self.flushing.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        transport: Box<dyn Transport>,
        remote: SocketAddr,
        handler: Arc<dyn PacketHandler>,
        read_buffer_size: usize,
        write_buffer_size: usize,
    ) -> Connection {
        Connection {
            id,
            remote,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            transport,
            read_buffer: Mutex::new(RingBuffer::new(read_buffer_size)),
            write_buffer: Mutex::new(RingBuffer::new(write_buffer_size)),
            arm_lock: Mutex::new(()),
            burst_scratch: Mutex::new(Vec::new()),
            notifier: RwLock::new(None),
            handler,
            stats: ConnectionStats::default(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.raw_fd()
    }

    /// Bytes queued and not yet transmitted.
    pub fn pending_output(&self) -> usize {
        self.write_buffer.lock().size()
    }

    pub fn read_buffer_capacity(&self) -> usize {
        self.read_buffer.lock().capacity()
    }

    /// Queues `data` and starts a flush unless one is already in flight.
    ///
    /// Returns false when the connection is not connected or the write buffer
    /// cannot take the whole slice; nothing is queued in that case.
    pub fn send(&self, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        if !self.write_buffer.lock().write(data) {
            trace!(
                "connection {} write buffer full, {} bytes refused",
                self.id,
                data.len()
            );
            return false;
        }

        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            match self.burst() {
                Burst::Drained => {}
                Burst::Pending => self.request_writable(),
                Burst::Failed(err) => {
                    debug!("connection {} send failed: {}", self.id, err);
                    self.disconnect();
                }
            }
        }
        true
    }

    pub fn send_frame(&self, opcode: u16, payload: &[u8]) -> bool {
        match Frame::encode_parts(opcode, payload) {
            Ok(wire) => self.send(&wire),
            Err(err) => {
                warn!("connection {} refused frame: {}", self.id, err);
                false
            }
        }
    }

    /// Explicit close request. Teardown runs on the multiplexer; calling this
    /// more than once is harmless.
    pub fn disconnect(&self) {
        if !self.begin_disconnect() {
            return;
        }
        match self.notifier() {
            Some(notifier) => notifier.notify_disconnect(self.id),
            None => {
                self.close();
            }
        }
    }

    /// Moves `Connecting`/`Connected` to `Disconnecting`. False when the
    /// connection was already on its way out.
    pub(crate) fn begin_disconnect(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= ConnectionState::Disconnecting as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn attach(&self, notifier: Weak<dyn ReadinessNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    pub(crate) fn detach(&self) {
        self.notifier.write().take();
    }

    fn notifier(&self) -> Option<Arc<dyn ReadinessNotifier>> {
        self.notifier.read().as_ref().and_then(Weak::upgrade)
    }

    /// `Connecting → Connected`, followed by the handler's connect callback.
    pub(crate) fn establish(self: &Arc<Self>) -> bool {
        let established = self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if established {
            self.handler.on_connect(self);
        }
        established
    }

    /// Reads once from the transport, then hands every complete frame to the
    /// handler.
    pub(crate) fn on_readable(self: &Arc<Self>) {
        if !self.is_connected() {
            return;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut peer_closed = false;
        let mut violation = None;
        let mut frames = Vec::new();
        {
            let mut buffer = self.read_buffer.lock();
            let want = buffer.writable_len().min(READ_CHUNK);
            if want > 0 {
                match self.transport.recv(&mut chunk[..want]) {
                    Ok(0) => peer_closed = true,
                    Ok(n) => {
                        buffer.write(&chunk[..n]);
                        self.stats
                            .bytes_received
                            .fetch_add(n as u64, Ordering::Relaxed);
                        trace!("connection {} read {} bytes", self.id, n);
                    }
                    Err(err) => {
                        if let Some(fatal) = fatal_io(err) {
                            debug!("connection {} read failed: {}", self.id, fatal);
                            self.begin_disconnect();
                            return;
                        }
                    }
                }
            }

            for decoded in FrameDecoder::frames(&mut buffer) {
                match decoded {
                    Ok(frame) => frames.push(frame),
                    Err(err) => violation = Some(err),
                }
            }

            if let Some(total) = FrameDecoder::pending_frame_len(&buffer) {
                if total > buffer.capacity() {
                    let from = buffer.capacity();
                    buffer.grow(total);
                    debug!(
                        "connection {} read buffer grown from {} to {} bytes",
                        self.id, from, total
                    );
                } else if buffer.writable_len() == 0 && buffer.free_space() > 0 {
                    buffer.compact();
                }
            }
        }

        // handlers run without the read buffer locked, they may close us
        for frame in frames {
            if !self.is_connected() {
                return;
            }
            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
            self.handler.on_frame(self, frame);
        }

        if let Some(err) = violation {
            warn!(
                "connection {} from {} disconnected: {}",
                self.id, self.remote, err
            );
            self.begin_disconnect();
            return;
        }

        if peer_closed {
            debug!("connection {} closed by peer {}", self.id, self.remote);
            self.begin_disconnect();
        }
    }

    /// Continues an in-flight flush with one more burst.
    pub(crate) fn on_writable(&self) {
        if !self.flushing.load(Ordering::SeqCst) {
            return;
        }
        if let Burst::Failed(err) = self.burst() {
            debug!("connection {} write failed: {}", self.id, err);
            self.begin_disconnect();
        }
    }

    /// One transmit call over the head of the write buffer, at most
    /// `MAX_BURST` bytes.
    ///
    /// Bursts are serialized by the scratch lock. The head is copied out so
    /// the buffer lock is not held across the transmit call and a concurrent
    /// `send` only waits for the copy. The in-flight flag is only cleared
    /// under the buffer lock, once the buffer is empty, so a concurrent
    /// `send` either sees it set or queues behind an already drained buffer
    /// and starts its own flush.
    fn burst(&self) -> Burst {
        let mut scratch = self.burst_scratch.lock();
        scratch.clear();
        {
            let buffer = self.write_buffer.lock();
            if buffer.is_empty() {
                self.flushing.store(false, Ordering::SeqCst);
                return Burst::Drained;
            }
            let head = buffer.readable_slice();
            scratch.extend_from_slice(&head[..head.len().min(MAX_BURST)]);
        }

        match self.transport.transmit(&scratch) {
            Ok(0) => Burst::Failed(AppError::FatalIo(io::Error::from(ErrorKind::WriteZero))),
            Ok(n) => {
                let mut buffer = self.write_buffer.lock();
                // only bursts consume, a closed connection has nothing left
                buffer.remove(n);
                self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                trace!("connection {} wrote {} bytes", self.id, n);
                if buffer.is_empty() {
                    self.flushing.store(false, Ordering::SeqCst);
                    Burst::Drained
                } else {
                    Burst::Pending
                }
            }
            Err(err) => match fatal_io(err) {
                None => Burst::Pending,
                Some(fatal) => Burst::Failed(fatal),
            },
        }
    }

    fn request_writable(&self) {
        if let Some(notifier) = self.notifier() {
            notifier.notify_writable(self.id);
        }
    }

    /// What the backend should report next for this connection.
    pub(crate) fn interest(&self) -> Interest {
        Interest {
            readable: true,
            writable: self.flushing.load(Ordering::SeqCst),
        }
    }

    /// Takes ownership for one readiness event.
    pub(crate) fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Gives ownership back and re-arms with the interest computed after
    /// ownership was dropped, so a flush requested meanwhile is not lost.
    pub(crate) fn release<F>(&self, rearm: F) -> io::Result<()>
    where
        F: FnOnce(Interest) -> io::Result<()>,
    {
        let _guard = self.arm_lock.lock();
        self.busy.store(false, Ordering::SeqCst);
        rearm(self.interest())
    }

    /// Idempotent teardown: shuts the transport down, releases both buffers
    /// and tells the handler. Returns false if it already ran.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        if let Err(err) = self.transport.close() {
            trace!("connection {} transport close: {}", self.id, err);
        }
        self.read_buffer.lock().release();
        {
            let mut buffer = self.write_buffer.lock();
            buffer.release();
            self.flushing.store(false, Ordering::SeqCst);
        }
        self.handler.on_disconnect(self);
        debug!(
            "connection {} from {} closed after {:?}",
            self.id,
            self.remote,
            self.created_at.elapsed()
        );
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("connection {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MemoryTransport, HEADER_LEN, MAX_PAYLOAD_LEN};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Frame>>,
        disconnects: AtomicUsize,
    }

    impl PacketHandler for Recorder {
        fn on_frame(&self, _connection: &Arc<Connection>, frame: Frame) {
            self.frames.lock().push(frame);
        }

        fn on_disconnect(&self, _connection: &Connection) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection(
        read: usize,
        write: usize,
    ) -> (Arc<Connection>, MemoryTransport, Arc<Recorder>) {
        let transport = MemoryTransport::new();
        let recorder = Arc::new(Recorder::default());
        let connection = Arc::new(Connection::new(
            next_connection_id(),
            Box::new(transport.clone()),
            "127.0.0.1:4000".parse().unwrap(),
            recorder.clone(),
            read,
            write,
        ));
        assert!(connection.establish());
        (connection, transport, recorder)
    }

    fn wire(opcode: u16, payload: &[u8]) -> Vec<u8> {
        Frame::encode_parts(opcode, payload).unwrap().to_vec()
    }

    #[test]
    fn test_state_machine_is_one_way() {
        let (connection, transport, recorder) = connection(64, 64);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(!connection.establish());

        connection.disconnect();
        // no multiplexer attached, teardown runs inline
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(transport.is_closed());
        assert!(!connection.begin_disconnect());
        assert!(!connection.close());
        connection.disconnect();
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
        assert!(!connection.send(b"late"));
    }

    #[test]
    fn test_send_flushes_immediately() {
        let (connection, transport, _) = connection(64, 64);
        assert!(connection.send(b"hello"));
        assert_eq!(transport.written(), b"hello");
        assert_eq!(connection.pending_output(), 0);
        assert_eq!(connection.interest(), Interest::READABLE);
        assert_eq!(connection.stats().bytes_sent(), 5);
    }

    #[test]
    fn test_partial_burst_keeps_flag_and_tail() {
        let (connection, transport, _) = connection(64, 64);
        transport.set_write_limit(Some(3));

        assert!(connection.send(b"abcdefgh"));
        assert_eq!(transport.written(), b"abc");
        assert!(connection.interest().writable);

        // in flight: this one only queues
        assert!(connection.send(b"XY"));
        assert_eq!(transport.transmit_calls(), 1);

        connection.on_writable();
        connection.on_writable();
        assert!(connection.interest().writable);
        connection.on_writable();
        assert_eq!(transport.written(), b"abcdefghXY");
        assert!(!connection.interest().writable);
    }

    #[test]
    fn test_would_block_keeps_everything_queued() {
        let (connection, transport, _) = connection(64, 64);
        transport.block_writes(true);
        assert!(connection.send(b"queued"));
        assert_eq!(connection.pending_output(), 6);
        assert!(connection.is_connected());

        transport.block_writes(false);
        connection.on_writable();
        assert_eq!(transport.written(), b"queued");
    }

    #[test]
    fn test_send_does_not_wait_for_transmit_in_flight() {
        let (connection, transport, _) = connection(64, 64);
        transport.hold_transmit(true);
        let flusher = {
            let connection = connection.clone();
            thread::spawn(move || connection.send(b"first"))
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.transmits_parked() == 0 {
            assert!(Instant::now() < deadline, "flush never reached the transport");
            thread::yield_now();
        }

        // the flusher is parked inside transmit, queueing goes around it
        let (queued_tx, queued_rx) = mpsc::channel();
        let sender = {
            let connection = connection.clone();
            thread::spawn(move || queued_tx.send(connection.send(b"second")).unwrap())
        };
        let queued = queued_rx.recv_timeout(Duration::from_secs(2));
        transport.hold_transmit(false);
        assert_eq!(queued, Ok(true));
        assert!(flusher.join().unwrap());
        sender.join().unwrap();

        assert_eq!(transport.take_written(), b"first");
        assert_eq!(connection.pending_output(), 6);
        connection.on_writable();
        assert_eq!(transport.take_written(), b"second");
        assert!(!connection.interest().writable);
    }

    #[test]
    fn test_only_hard_errors_are_fatal() {
        assert!(fatal_io(io::Error::from(ErrorKind::WouldBlock)).is_none());
        assert!(fatal_io(io::Error::from(ErrorKind::Interrupted)).is_none());
        assert!(matches!(
            fatal_io(io::Error::from(ErrorKind::ConnectionReset)),
            Some(AppError::FatalIo(_))
        ));

        // a broken pipe on send tears the connection down
        let (connection, transport, recorder) = connection(64, 64);
        transport.close().unwrap();
        assert!(connection.send(b"lost"));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_full_write_buffer_refuses_whole_message() {
        let (connection, transport, _) = connection(64, 8);
        transport.block_writes(true);
        assert!(connection.send(b"12345"));
        assert!(!connection.send(b"6789"));
        assert_eq!(connection.pending_output(), 5);
        assert!(connection.is_connected());
    }

    #[test]
    fn test_send_frame_rejects_oversized_payload() {
        let (connection, transport, _) = connection(64, 64);
        assert!(!connection.send_frame(1, &vec![0; MAX_PAYLOAD_LEN + 1]));
        assert!(connection.send_frame(1, b"ok"));
        assert_eq!(transport.written(), wire(1, b"ok"));
    }

    #[test]
    fn test_split_frame_across_reads() {
        let (connection, transport, recorder) = connection(64, 64);
        let bytes = wire(3, b"payload");

        transport.push_inbound(&bytes[..HEADER_LEN]);
        connection.on_readable();
        assert!(recorder.frames.lock().is_empty());

        transport.push_inbound(&bytes[HEADER_LEN..]);
        connection.on_readable();
        assert_eq!(
            *recorder.frames.lock(),
            vec![Frame::new(3, &b"payload"[..])]
        );
        assert_eq!(connection.stats().frames_received(), 1);
    }

    #[test]
    fn test_oversized_header_disconnects() {
        let (connection, transport, recorder) = connection(64, 64);
        let mut header = vec![1, 0];
        header.extend(70000u32.to_le_bytes());
        transport.push_inbound(&header);

        connection.on_readable();
        assert_eq!(connection.state(), ConnectionState::Disconnecting);
        assert!(recorder.frames.lock().is_empty());
    }

    #[test]
    fn test_peer_close_after_last_frame() {
        let (connection, transport, recorder) = connection(64, 64);
        transport.push_inbound(&wire(9, b"bye"));
        transport.close_inbound();

        connection.on_readable();
        assert_eq!(recorder.frames.lock().len(), 1);
        assert!(connection.is_connected());

        connection.on_readable();
        assert_eq!(connection.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_fatal_read_error_disconnects() {
        let (connection, transport, _) = connection(64, 64);
        transport.fail_next_read(ErrorKind::ConnectionReset);
        connection.on_readable();
        assert_eq!(connection.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_read_buffer_grows_for_large_frame() {
        let (connection, transport, recorder) = connection(64, 64);
        let payload = vec![7u8; 1000];
        transport.push_inbound(&wire(2, &payload));

        for _ in 0..40 {
            connection.on_readable();
            if !recorder.frames.lock().is_empty() {
                break;
            }
        }
        assert_eq!(connection.read_buffer_capacity(), HEADER_LEN + 1000);
        assert_eq!(recorder.frames.lock()[0].payload().len(), 1000);
    }

    #[test]
    fn test_close_releases_buffers() {
        let (connection, transport, _) = connection(64, 64);
        transport.block_writes(true);
        assert!(connection.send(b"stuck"));
        assert!(connection.close());
        assert_eq!(connection.pending_output(), 0);
        assert_eq!(connection.read_buffer_capacity(), 0);
        assert!(!connection.interest().writable);
    }
}
