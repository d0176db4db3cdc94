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

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Backend, Event, Interest, Token};

/// In-process backend with no kernel underneath. Readiness is injected with
/// [`MemoryBackend::set_ready`] and reported with the same one-shot rules as
/// the real backends, which makes dispatch deterministic in tests.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    changed: Condvar,
}

#[derive(Default)]
struct MemoryState {
    registered: HashMap<Token, Option<Interest>>,
    ready: BTreeMap<Token, Interest>,
    woken: bool,
}

impl MemoryState {
    fn take_events(&mut self, events: &mut Vec<Event>) -> bool {
        let mut found = false;
        for (token, armed) in self.registered.iter_mut() {
            let Some(interest) = *armed else {
                continue;
            };
            let Some(ready) = self.ready.get(token) else {
                continue;
            };
            let hit = ready.intersect(interest);
            if hit.is_empty() {
                continue;
            }
            *armed = None;
            found = true;
            events.push(Event {
                token: *token,
                readable: hit.readable,
                writable: hit.writable,
            });
        }
        found
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `token` ready. Stays ready until cleared, like a level.
    pub fn set_ready(&self, token: Token, interest: Interest) {
        let mut state = self.state.lock();
        let entry = state.ready.entry(token).or_default();
        entry.readable |= interest.readable;
        entry.writable |= interest.writable;
        self.changed.notify_all();
    }

    pub fn clear_ready(&self, token: Token) {
        self.state.lock().ready.remove(&token);
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.state.lock().registered.contains_key(&token)
    }

    pub fn is_armed(&self, token: Token) -> bool {
        self.armed_interest(token).is_some()
    }

    pub fn armed_interest(&self, token: Token) -> Option<Interest> {
        self.state.lock().registered.get(&token).copied().flatten()
    }

    fn arm(&self, token: Token, interest: Interest) {
        let mut state = self.state.lock();
        state.registered.insert(token, Some(interest));
        self.changed.notify_all();
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn register(&self, token: Token, _fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.arm(token, interest);
        Ok(())
    }

    fn rearm(&self, token: Token, _fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.registered.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("token {} is not registered", token),
            ));
        }
        state.registered.insert(token, Some(interest));
        self.changed.notify_all();
        Ok(())
    }

    fn deregister(&self, token: Token, _fd: Option<RawFd>) -> io::Result<()> {
        let mut state = self.state.lock();
        state.registered.remove(&token);
        state.ready.remove(&token);
        Ok(())
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        loop {
            if state.take_events(events) {
                return Ok(());
            }
            if state.woken {
                state.woken = false;
                return Ok(());
            }
            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn wake(&self) -> io::Result<()> {
        self.state.lock().woken = true;
        self.changed.notify_all();
        Ok(())
    }
}
