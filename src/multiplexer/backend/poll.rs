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

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::fd::RawFd;
use std::time::Duration;

use libc::{pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};
use parking_lot::Mutex;

use super::waker::Waker;
use super::{require_fd, timeout_ms, Backend, Event, Interest, Token};

/// Portable level-triggered `poll(2)` made one-shot by dropping every
/// reported entry from the armed set.
pub struct PollBackend {
    armed: Mutex<HashMap<Token, (RawFd, Interest)>>,
    waker: Waker,
}

impl PollBackend {
    pub fn new() -> io::Result<Self> {
        Ok(PollBackend {
            armed: Mutex::new(HashMap::new()),
            waker: Waker::new()?,
        })
    }

    fn arm(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        let fd = require_fd(fd)?;
        self.armed.lock().insert(token, (fd, interest));
        // a poll already in progress works from an older snapshot
        self.waker.wake()
    }
}

fn to_poll_events(interest: Interest) -> i16 {
    let mut events = 0;
    if interest.readable {
        events |= POLLIN;
    }
    if interest.writable {
        events |= POLLOUT;
    }
    events
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.arm(token, fd, interest)
    }

    fn rearm(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.arm(token, fd, interest)
    }

    fn deregister(&self, token: Token, _fd: Option<RawFd>) -> io::Result<()> {
        self.armed.lock().remove(&token);
        Ok(())
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let (mut fds, tokens) = {
            let armed = self.armed.lock();
            let mut fds = Vec::with_capacity(armed.len() + 1);
            let mut tokens = Vec::with_capacity(armed.len());
            fds.push(pollfd {
                fd: self.waker.as_raw_fd(),
                events: POLLIN,
                revents: 0,
            });
            for (token, (fd, interest)) in armed.iter() {
                fds.push(pollfd {
                    fd: *fd,
                    events: to_poll_events(*interest),
                    revents: 0,
                });
                tokens.push(*token);
            }
            (fds, tokens)
        };

        let ret = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(());
        }
        if fds[0].revents != 0 {
            self.waker.drain();
        }

        let mut armed = self.armed.lock();
        for (pfd, token) in fds[1..].iter().zip(tokens) {
            if pfd.revents == 0 {
                continue;
            }
            // deregistered while we were blocked
            if armed.get(&token).map(|(fd, _)| *fd) != Some(pfd.fd) {
                continue;
            }
            armed.remove(&token);
            let revents = pfd.revents;
            events.push(Event {
                token,
                readable: revents & (POLLIN | POLLHUP | POLLERR | POLLNVAL) != 0,
                writable: revents & (POLLOUT | POLLERR) != 0,
            });
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
