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

//! Multiplexer Module Implementation
//!
//! Readiness loop over the connection registry.
//!
//! # Ownership
//!
//! A connection reported by [`Multiplexer::poll`] is claimed by the caller
//! (its `busy` flag) and stays claimed until [`Multiplexer::dispatch`] hands
//! it back. Backends are one-shot, so a claimed connection is never reported
//! again before it is re-armed, and re-arming happens only on release. This
//! is what keeps two workers off the same connection's buffers.
//!
//! Other threads reach a connection they do not own through the pending
//! queue: a partial flush from `send` or an explicit `disconnect` is queued
//! and the backend woken, and the next poll claims the connection for it.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::network::{
    next_connection_id, Connection, ConnectionFactory, ConnectionId, ConnectionState,
    ReadinessNotifier,
};
use crate::{AppError, AppResult};

pub use backend::{
    Backend, BackendKind, CompletionBackend, Event, Interest, MemoryBackend, PollBackend, Token,
};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use backend::EpollBackend;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub use backend::KqueueBackend;
pub use worker::WorkerPool;

mod backend;
mod worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Writable,
    Disconnect,
}

/// One claimed connection and what it is ready for.
#[derive(Debug)]
pub struct Ready {
    connection: Arc<Connection>,
    readable: bool,
    writable: bool,
}

impl Ready {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Result of one poll. Every entry is claimed by the poller and must be
/// handed to [`Multiplexer::dispatch`], otherwise its connection is never
/// armed again.
#[derive(Debug, Default)]
pub struct ReadySets {
    entries: Vec<Ready>,
}

impl ReadySets {
    pub fn readable(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.entries
            .iter()
            .filter(|ready| ready.readable)
            .map(|ready| &ready.connection)
    }

    pub fn writable(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.entries
            .iter()
            .filter(|ready| ready.writable)
            .map(|ready| &ready.connection)
    }

    pub fn readable_ids(&self) -> Vec<ConnectionId> {
        self.readable().map(|connection| connection.id()).collect()
    }

    pub fn writable_ids(&self) -> Vec<ConnectionId> {
        self.writable().map(|connection| connection.id()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ready> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Shared {
    backend: Arc<dyn Backend>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    pending: Mutex<Vec<(ConnectionId, Pending)>>,
    max_connections: usize,
    draining: AtomicBool,
    halted: AtomicBool,
}

impl Shared {
    fn push_pending(&self, id: ConnectionId, pending: Pending) {
        self.pending.lock().push((id, pending));
        if let Err(err) = self.backend.wake() {
            error!("failed to wake {} backend: {}", self.backend.name(), err);
        }
    }

    /// Single exit for registered connections: registry removal, backend
    /// deregistration and the connection's own teardown.
    fn teardown(&self, connection: &Arc<Connection>) {
        let removed = self.connections.write().remove(&connection.id()).is_some();
        if removed {
            if let Err(err) = self
                .backend
                .deregister(connection.id(), connection.raw_fd())
            {
                debug!(
                    "deregistering connection {} from {}: {}",
                    connection.id(),
                    self.backend.name(),
                    err
                );
            }
        }
        connection.begin_disconnect();
        connection.close();
    }

    /// Hands a claimed connection back: tears it down when it is on its way
    /// out, otherwise re-arms it with its current interest.
    fn settle(&self, connection: &Arc<Connection>) {
        if connection.state() >= ConnectionState::Disconnecting {
            self.teardown(connection);
            return;
        }
        let id = connection.id();
        let rearmed = connection.release(|interest| {
            // unregistered connections belong to someone else now
            let connections = self.connections.read();
            if connections.contains_key(&id) {
                self.backend.rearm(id, connection.raw_fd(), interest)
            } else {
                Ok(())
            }
        });
        if let Err(err) = rearmed {
            warn!("failed to re-arm connection {}: {}", id, err);
            if connection.try_claim() {
                self.teardown(connection);
            }
            return;
        }
        // a disconnect requested while we owned it could not claim it
        if connection.state() >= ConnectionState::Disconnecting && connection.try_claim() {
            self.teardown(connection);
        }
    }
}

impl ReadinessNotifier for Shared {
    fn notify_writable(&self, id: ConnectionId) {
        self.push_pending(id, Pending::Writable);
    }

    fn notify_disconnect(&self, id: ConnectionId) {
        self.push_pending(id, Pending::Disconnect);
    }
}

pub struct Multiplexer {
    shared: Arc<Shared>,
    poll_lock: Mutex<Vec<Event>>,
}

impl Multiplexer {
    pub fn new(kind: BackendKind, max_connections: usize) -> AppResult<Self> {
        Ok(Self::with_backend(kind.build()?, max_connections))
    }

    pub fn with_backend(backend: Arc<dyn Backend>, max_connections: usize) -> Self {
        debug!(
            "multiplexer using {} backend, at most {} connections",
            backend.name(),
            max_connections
        );
        Multiplexer {
            shared: Arc::new(Shared {
                backend,
                connections: RwLock::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                max_connections,
                draining: AtomicBool::new(false),
                halted: AtomicBool::new(false),
            }),
            poll_lock: Mutex::new(Vec::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.connections.read().get(&id).cloned()
    }

    /// Adds `connection` to the registry, moves it to `Connected` and arms it
    /// for reading.
    ///
    /// At capacity (or while draining) the connection is closed on the spot
    /// and false is returned; registered connections are not affected.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        let id = connection.id();
        {
            let mut connections = self.shared.connections.write();
            let refusal = if self.shared.draining.load(Ordering::SeqCst) {
                Some(AppError::IllegalStateError(
                    "multiplexer is shutting down".to_string(),
                ))
            } else if connections.len() >= self.shared.max_connections {
                Some(AppError::CapacityExceeded {
                    limit: self.shared.max_connections,
                })
            } else if connections.contains_key(&id) {
                Some(AppError::IllegalStateError(format!(
                    "connection {} is already registered",
                    id
                )))
            } else {
                None
            };
            if let Some(err) = refusal {
                drop(connections);
                warn!(
                    "rejected connection {} from {}: {}",
                    id,
                    connection.remote_address(),
                    err
                );
                connection.begin_disconnect();
                connection.close();
                return false;
            }
            connections.insert(id, connection.clone());
        }

        // owned by us until it is armed for the first time
        connection.try_claim();
        let notifier: Weak<Shared> = Arc::downgrade(&self.shared);
        connection.attach(notifier);
        connection.establish();

        if connection.state() >= ConnectionState::Disconnecting {
            self.shared.teardown(&connection);
            return false;
        }
        let backend = &self.shared.backend;
        if let Err(err) =
            connection.release(|interest| backend.register(id, connection.raw_fd(), interest))
        {
            warn!(
                "{} backend refused connection {} from {}: {}",
                backend.name(),
                id,
                connection.remote_address(),
                err
            );
            if connection.try_claim() {
                self.shared.teardown(&connection);
            }
            return false;
        }
        if connection.state() >= ConnectionState::Disconnecting && connection.try_claim() {
            self.shared.teardown(&connection);
        }
        debug!(
            "connection {} from {} registered, {} active",
            id,
            connection.remote_address(),
            self.connection_count()
        );
        true
    }

    /// Removes `connection` from the registry and the backend without closing
    /// it. The caller takes the connection over.
    pub fn unregister(&self, connection: &Arc<Connection>) -> bool {
        let removed = self
            .shared
            .connections
            .write()
            .remove(&connection.id())
            .is_some();
        if !removed {
            return false;
        }
        if let Err(err) = self
            .shared
            .backend
            .deregister(connection.id(), connection.raw_fd())
        {
            debug!("deregistering connection {}: {}", connection.id(), err);
        }
        connection.detach();
        debug!("connection {} unregistered", connection.id());
        true
    }

    /// Outbound connection to `addr`, built by `factory` and registered like
    /// an accepted one.
    pub fn connect(
        &self,
        addr: SocketAddr,
        factory: &dyn ConnectionFactory,
    ) -> AppResult<Arc<Connection>> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let id = next_connection_id();
        let connection = Arc::new(factory.create(id, Box::new(stream), addr)?);
        if !self.register(connection.clone()) {
            return Err(AppError::CapacityExceeded {
                limit: self.shared.max_connections,
            });
        }
        Ok(connection)
    }

    /// Waits up to `timeout` for readiness and claims every reported
    /// connection. Requests queued by other threads are served first and
    /// make the wait non-blocking.
    ///
    /// Polls are serialized: while one caller waits on the backend the others
    /// wait for it.
    pub fn poll(&self, timeout: Option<Duration>) -> AppResult<ReadySets> {
        let mut events = self.poll_lock.lock();
        events.clear();
        if self.shared.halted.load(Ordering::SeqCst) {
            return Ok(ReadySets::default());
        }

        let pending = std::mem::take(&mut *self.shared.pending.lock());
        let timeout = if pending.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        self.shared.backend.poll(&mut events, timeout)?;

        let mut ready = ReadySets::default();
        let mut index: HashMap<ConnectionId, usize> = HashMap::new();
        let connections = self.shared.connections.read();
        let mut claim = |id: ConnectionId, readable: bool, writable: bool| {
            if let Some(&at) = index.get(&id) {
                let entry: &mut Ready = &mut ready.entries[at];
                entry.readable |= readable;
                entry.writable |= writable;
                return;
            }
            let Some(connection) = connections.get(&id) else {
                trace!("readiness for unknown connection {}", id);
                return;
            };
            if !connection.try_claim() {
                // the owner re-arms on release
                trace!("connection {} is busy, event folded", id);
                return;
            }
            index.insert(id, ready.entries.len());
            ready.entries.push(Ready {
                connection: connection.clone(),
                readable,
                writable,
            });
        };

        for (id, pending) in pending {
            claim(id, false, pending == Pending::Writable);
        }
        for event in events.drain(..) {
            claim(event.token, event.readable, event.writable);
        }
        Ok(ready)
    }

    /// Runs the callbacks for every claimed connection, then releases or
    /// tears each one down. A panicking handler disconnects its connection.
    pub fn dispatch(&self, ready: ReadySets) {
        for entry in ready.entries {
            let connection = entry.connection;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if entry.readable {
                    connection.on_readable();
                }
                if entry.writable && connection.is_connected() {
                    connection.on_writable();
                }
            }));
            if let Err(payload) = outcome {
                log_handler_panic(connection.id(), payload);
                connection.begin_disconnect();
            }
            self.shared.settle(&connection);
        }
    }

    /// One `poll` + `dispatch` round, returns the number of connections
    /// served.
    pub fn run_once(&self, timeout: Option<Duration>) -> AppResult<usize> {
        let ready = self.poll(timeout)?;
        let served = ready.len();
        self.dispatch(ready);
        Ok(served)
    }

    /// Asks every registered connection to disconnect and refuses new
    /// registrations. Workers carry out the teardowns.
    pub fn shutdown_connections(&self) -> usize {
        self.shared.draining.store(true, Ordering::SeqCst);
        let connections: Vec<_> = self.shared.connections.read().values().cloned().collect();
        for connection in &connections {
            connection.disconnect();
        }
        debug!("asked {} connections to disconnect", connections.len());
        connections.len()
    }

    /// Blocks until the registry is empty or `timeout` passes.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.connection_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Forced teardown of whatever is still registered. Only safe once no
    /// worker polls anymore.
    pub fn close_all(&self) -> usize {
        let connections: Vec<_> = self
            .shared
            .connections
            .read()
            .values()
            .cloned()
            .collect();
        for connection in &connections {
            self.shared.teardown(connection);
        }
        if !connections.is_empty() {
            warn!("forced close of {} connections", connections.len());
        }
        connections.len()
    }

    pub(crate) fn halt(&self) {
        self.shared.halted.store(true, Ordering::SeqCst);
        if let Err(err) = self.shared.backend.wake() {
            error!("failed to wake {} backend: {}", self.backend_name(), err);
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("backend", &self.backend_name())
            .field("connections", &self.connection_count())
            .field("max_connections", &self.shared.max_connections)
            .finish()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn log_handler_panic(id: ConnectionId, payload: Box<dyn std::any::Any + Send>) {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("handler for connection {id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("handler for connection {id} panicked with message: {message}");
    } else {
        error!(
            "handler for connection {id} panicked with an unknown type: {}",
            type_name_of(&payload)
        );
    }
}

#[inline]
fn type_name_of<R>(_: &R) -> &'static str {
    type_name::<R>()
}
