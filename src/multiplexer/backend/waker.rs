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
use std::os::raw::{c_int, c_void};

use libc::{FD_CLOEXEC, F_GETFD, F_GETFL, F_SETFD, F_SETFL, O_NONBLOCK};

use super::cvt;

/// Self-pipe used to interrupt a blocked poll.
#[derive(Debug)]
pub(crate) struct Waker {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds: [c_int; 2] = [0; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // SAFETY: pipe(2) succeeded, both descriptors are fresh and owned here
        let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblocking_cloexec(reader.as_raw_fd())?;
        set_nonblocking_cloexec(writer.as_raw_fd())?;
        Ok(Waker { reader, writer })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        let ret = unsafe {
            libc::write(
                self.writer.as_raw_fd(),
                &byte as *const u8 as *const c_void,
                1,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // a full pipe already has a wake-up pending
            if err.kind() != ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let ret = unsafe {
                libc::read(
                    self.reader.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                )
            };
            if ret <= 0 {
                break;
            }
        }
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

pub(crate) fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, F_SETFL, flags | O_NONBLOCK) })?;
    let fd_flags = cvt(unsafe { libc::fcntl(fd, F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, F_SETFD, fd_flags | FD_CLOEXEC) })?;
    Ok(())
}
