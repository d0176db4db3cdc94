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

//! Readiness backends.
//!
//! Every backend is one-shot: once a token is reported it stays silent until
//! it is re-armed. That is what lets several workers share one backend while
//! each connection is handled by a single worker at a time.
//!
//! The backend is chosen at runtime through [`BackendKind`]. The kernel
//! specific ones only exist on their platforms; asking for one elsewhere is a
//! configuration error.

use std::io;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

pub use completion::CompletionBackend;
pub use memory::MemoryBackend;
pub use poll::PollBackend;

mod completion;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
mod memory;
mod poll;
mod waker;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::EpollBackend;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub use kqueue::KqueueBackend;

/// Identifies a registration. The multiplexer uses connection ids.
pub type Token = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    pub fn intersect(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable && other.readable,
            writable: self.writable && other.writable,
        }
    }
}

/// One readiness report. Errors and hang-ups are reported as readable so the
/// following read discovers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts watching `fd` and arms it for one report.
    fn register(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()>;

    /// Arms an already registered token for one more report.
    fn rearm(&self, token: Token, fd: Option<RawFd>, interest: Interest) -> io::Result<()>;

    fn deregister(&self, token: Token, fd: Option<RawFd>) -> io::Result<()>;

    /// Appends ready tokens to `events`, blocking up to `timeout` (`None`
    /// blocks until something happens or [`Backend::wake`] is called).
    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;

    /// Interrupts a blocked `poll`.
    fn wake(&self) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// epoll on Linux, kqueue on macOS/FreeBSD, poll elsewhere
    #[default]
    Auto,
    Poll,
    Epoll,
    Kqueue,
    Completion,
}

impl BackendKind {
    pub fn build(self) -> AppResult<Arc<dyn Backend>> {
        match self {
            BackendKind::Auto => Self::platform_default().build(),
            BackendKind::Poll => Ok(Arc::new(PollBackend::new()?)),
            BackendKind::Epoll => build_epoll(),
            BackendKind::Kqueue => build_kqueue(),
            BackendKind::Completion => Ok(Arc::new(CompletionBackend::new()?)),
        }
    }

    pub fn platform_default() -> BackendKind {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            BackendKind::Epoll
        } else if cfg!(any(target_os = "macos", target_os = "ios", target_os = "freebsd")) {
            BackendKind::Kqueue
        } else {
            BackendKind::Poll
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            BackendKind::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            BackendKind::Kqueue => {
                cfg!(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))
            }
            _ => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::Poll => "poll",
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Completion => "completion",
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn build_epoll() -> AppResult<Arc<dyn Backend>> {
    Ok(Arc::new(EpollBackend::new()?))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn build_epoll() -> AppResult<Arc<dyn Backend>> {
    Err(AppError::UnsupportedBackend("epoll"))
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn build_kqueue() -> AppResult<Arc<dyn Backend>> {
    Ok(Arc::new(KqueueBackend::new()?))
}

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
fn build_kqueue() -> AppResult<Arc<dyn Backend>> {
    Err(AppError::UnsupportedBackend("kqueue"))
}

pub(crate) fn require_fd(fd: Option<RawFd>) -> io::Result<RawFd> {
    fd.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "this backend needs a socket descriptor",
        )
    })
}

pub(crate) fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Milliseconds for poll/epoll_wait, rounding up so a short timeout does not
/// turn into a busy loop. `None` maps to -1 (infinite).
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> c_int {
    match timeout {
        None => -1,
        Some(timeout) => {
            let mut ms = timeout.as_millis();
            if Duration::from_millis(ms as u64) < timeout {
                ms += 1;
            }
            ms.min(c_int::MAX as u128) as c_int
        }
    }
}
