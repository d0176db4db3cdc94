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
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use super::poll::PollBackend;
use super::{Backend, Event, Interest, Token};

const NOTIFIER_TICK: Duration = Duration::from_millis(50);

/// Completion-port model: a notifier thread watches the sockets and posts a
/// completion packet per ready token into a queue the workers dequeue from.
/// Workers never touch the kernel readiness interface themselves.
pub struct CompletionBackend {
    port: Arc<CompletionPort>,
    watcher: Arc<PollBackend>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct CompletionPort {
    packets: Mutex<PortState>,
    posted: Condvar,
    running: AtomicBool,
}

#[derive(Default)]
struct PortState {
    queue: VecDeque<Event>,
    woken: bool,
}

impl CompletionPort {
    fn post(&self, batch: &mut Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.packets.lock();
        state.queue.extend(batch.drain(..));
        self.posted.notify_all();
    }
}

impl CompletionBackend {
    pub fn new() -> io::Result<Self> {
        let port = Arc::new(CompletionPort {
            running: AtomicBool::new(true),
            ..Default::default()
        });
        let watcher = Arc::new(PollBackend::new()?);

        let notifier = {
            let port = port.clone();
            let watcher = watcher.clone();
            thread::Builder::new()
                .name("gamenet-completion".to_string())
                .spawn(move || {
                    let mut batch = Vec::new();
                    while port.running.load(Ordering::Acquire) {
                        if let Err(err) = watcher.poll(&mut batch, Some(NOTIFIER_TICK)) {
                            error!("completion notifier poll failed: {}", err);
                            thread::sleep(NOTIFIER_TICK);
                            continue;
                        }
                        port.post(&mut batch);
                    }
                    trace!("completion notifier stopped");
                })?
        };

        Ok(CompletionBackend {
            port,
            watcher,
            notifier: Mutex::new(Some(notifier)),
        })
    }
}

impl Backend for CompletionBackend {
    fn name(&self) -> &'static str {
        "completion"
    }

    fn register(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.watcher.register(token, fd, interest)
    }

    fn rearm(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.watcher.rearm(token, fd, interest)
    }

    fn deregister(&self, token: Token, fd: Option<RawFd>) -> io::Result<()> {
        self.watcher.deregister(token, fd)?;
        // drop packets already posted for it
        self.port
            .packets
            .lock()
            .queue
            .retain(|event| event.token != token);
        Ok(())
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.port.packets.lock();
        loop {
            if !state.queue.is_empty() {
                events.extend(state.queue.drain(..));
                return Ok(());
            }
            if state.woken {
                state.woken = false;
                return Ok(());
            }
            match deadline {
                None => self.port.posted.wait(&mut state),
                Some(deadline) => {
                    if self.port.posted.wait_until(&mut state, deadline).timed_out() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn wake(&self) -> io::Result<()> {
        let mut state = self.port.packets.lock();
        state.woken = true;
        self.port.posted.notify_all();
        Ok(())
    }
}

impl Drop for CompletionBackend {
    fn drop(&mut self) {
        self.port.running.store(false, Ordering::Release);
        let _ = self.watcher.wake();
        if let Some(handle) = self.notifier.lock().take() {
            if handle.join().is_err() {
                error!("completion notifier panicked");
            }
        }
    }
}
