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
use std::{mem, ptr};

use libc::{
    EVFILT_READ, EVFILT_USER, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE, EV_DISABLE, EV_DISPATCH,
    EV_ENABLE, EV_EOF, EV_ERROR, NOTE_TRIGGER,
};
use parking_lot::Mutex;

use super::{cvt, require_fd, Backend, Event, Interest, Token};

const WAKE_IDENT: usize = 1;
const MAX_EVENTS: usize = 1024;

/// BSD/macOS kqueue with `EV_DISPATCH` filters: a delivered filter is
/// disabled until the next re-arm.
pub struct KqueueBackend {
    kqueue: OwnedFd,
    events: Mutex<Vec<libc::kevent>>,
}

fn kevent(ident: usize, filter: i16, flags: u16, fflags: u32, udata: usize) -> libc::kevent {
    // SAFETY: kevent is plain old data, zero is a valid value for every field
    let mut event: libc::kevent = unsafe { mem::zeroed() };
    event.ident = ident as _;
    event.filter = filter as _;
    event.flags = flags as _;
    event.fflags = fflags as _;
    event.udata = udata as _;
    event
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::kqueue() })?;
        // SAFETY: freshly created and owned here
        let kqueue = unsafe { OwnedFd::from_raw_fd(fd) };
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        let backend = KqueueBackend {
            kqueue,
            events: Mutex::new(Vec::with_capacity(MAX_EVENTS)),
        };
        backend.submit(&[kevent(
            WAKE_IDENT,
            EVFILT_USER,
            EV_ADD | EV_CLEAR,
            0,
            0,
        )])?;
        Ok(backend)
    }

    fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
        cvt(unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })?;
        Ok(())
    }

    fn arm(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        let fd = require_fd(fd)? as usize;
        let toggle = |on: bool| if on { EV_ENABLE } else { EV_DISABLE };
        self.submit(&[
            kevent(
                fd,
                EVFILT_READ,
                EV_ADD | EV_DISPATCH | toggle(interest.readable),
                0,
                token as usize,
            ),
            kevent(
                fd,
                EVFILT_WRITE,
                EV_ADD | EV_DISPATCH | toggle(interest.writable),
                0,
                token as usize,
            ),
        ])
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn register(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.arm(token, fd, interest)
    }

    fn rearm(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()> {
        self.arm(token, fd, interest)
    }

    fn deregister(&self, _token: Token, fd: Option<RawFd>) -> io::Result<()> {
        let fd = require_fd(fd)? as usize;
        for filter in [EVFILT_READ, EVFILT_WRITE] {
            // ENOENT when the filter was never added, EBADF once the fd is gone
            let _ = self.submit(&[kevent(fd, filter, EV_DELETE, 0, 0)]);
        }
        Ok(())
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timespec = timeout.map(|timeout| libc::timespec {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as _,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);

        let mut buffer = self.events.lock();
        buffer.clear();
        let ret = unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                buffer.as_mut_ptr(),
                buffer.capacity() as c_int,
                timespec_ptr,
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
            if raw.filter == EVFILT_USER {
                continue;
            }
            let failed = raw.flags & (EV_EOF | EV_ERROR) != 0;
            events.push(Event {
                token: raw.udata as usize as Token,
                readable: raw.filter == EVFILT_READ || failed,
                writable: raw.filter == EVFILT_WRITE,
            });
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        self.submit(&[kevent(WAKE_IDENT, EVFILT_USER, 0, NOTE_TRIGGER, 0)])
    }
}
