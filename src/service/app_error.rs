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

pub type AppResult<T> = Result<T, AppError>;

/// Errors surfaced by the network engine.
///
/// Would-block conditions never show up here: they are retried on the next
/// readiness event. A full ring buffer is reported as `false` from the write
/// or send call, not as an error value.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("readiness backend {0} is not available on this platform")]
    UnsupportedBackend(&'static str),

    /// transport errors other than would-block, the connection is torn down
    #[error("fatal transport error: {0}")]
    FatalIo(std::io::Error),

    /// oversized or malformed frame, the peer is disconnected
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// registry is full, only the new connection is rejected
    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    /// marker error, more bytes are needed before a frame can be decoded
    #[error("incomplete frame")]
    Incomplete,
}
