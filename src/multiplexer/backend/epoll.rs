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

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::raw::c_int;
use std::time::Duration;

use libc::{
    epoll_event, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, EPOLL_CLOEXEC,
    EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use parking_lot::Mutex;

use super::waker::Waker;
use super::{cvt, require_fd, timeout_ms, Backend, Event, Interest, Token};

const WAKE_TOKEN: u64 = u64::MAX;
const MAX_EVENTS: usize = 1024;

/// Linux epoll with `EPOLLONESHOT` registrations.
pub struct EpollBackend {
    epoll: OwnedFd,
    waker: Waker,
    events: Mutex<Vec<epoll_event>>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::epoll_create1(EPOLL_CLOEXEC) })?;
        // SAFETY: freshly created and owned here
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        let backend = EpollBackend {
            epoll,
            waker: Waker::new()?,
            events: Mutex::new(Vec::with_capacity(MAX_EVENTS)),
        };
        backend.ctl(
            EPOLL_CTL_ADD,
            backend.waker.as_raw_fd(),
            EPOLLIN as u32,
            WAKE_TOKEN,
        )?;
        Ok(backend)
    }

    fn ctl(&self, op: c_int, fd: RawFd, flags: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags,
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) })?;
        Ok(())
    }
}

fn to_epoll_flags(interest: Interest) -> u32 {
    let mut flags = (EPOLLONESHOT | EPOLLRDHUP) as u32;
    if interest.readable {
        flags |= EPOLLIN as u32;
    }
    if interest.writable {
        flags |= EPOLLOUT as u32;
    }
    flags
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, require_fd(fd)?, to_epoll_flags(interest), token)
    }

    fn rearm(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        let fd = require_fd(fd)?;
        match self.ctl(EPOLL_CTL_MOD, fd, to_epoll_flags(interest), token) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(EPOLL_CTL_ADD, fd, to_epoll_flags(interest), token)
            }
            other => other,
        }
    }

    fn deregister(&self, _token: Token, fd: Option<RawFd>) -> io::Result<()> {
        let fd = require_fd(fd)?;
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => {}
                _ => return Err(err),
            }
        }
        Ok(())
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let mut buffer = self.events.lock();
        buffer.clear();
        let ret = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                buffer.as_mut_ptr(),
                buffer.capacity() as c_int,
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
        // SAFETY: the kernel initialised the first `ret` entries
        unsafe { buffer.set_len(ret as usize) };

        for raw in buffer.iter() {
            // packed struct, copy the fields out
            let token = raw.u64;
            let flags = raw.events;
            if token == WAKE_TOKEN {
                self.waker.drain();
                continue;
            }
            let hangup = (EPOLLHUP | EPOLLRDHUP | EPOLLERR) as u32;
            events.push(Event {
                token,
                readable: flags & (EPOLLIN as u32 | hangup) != 0,
                writable: flags & (EPOLLOUT | EPOLLERR) as u32 != 0,
            });
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
