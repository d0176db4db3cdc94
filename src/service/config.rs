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

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::multiplexer::BackendKind;
use crate::network::{HEADER_LEN, MAX_PAYLOAD_LEN};

use super::{AppError, AppResult};

/// Prefix for environment overrides, e.g. `GAMENET__NETWORK__PORT=9000`.
const ENV_PREFIX: &str = "GAMENET";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// TCP_NODELAY on accepted sockets
    pub nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 8085,
            max_connection: 1024,
            nodelay: true,
        }
    }
}

/// Per-connection ring buffer capacities, in bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            read_buffer_size: 128 * 1024,
            write_buffer_size: 128 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub backend: BackendKind,
    /// 0 means one worker per CPU
    pub workers: usize,
    pub poll_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        MultiplexerConfig {
            backend: BackendKind::Auto,
            workers: 0,
            poll_timeout_ms: 100,
            shutdown_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub buffers: BufferConfig,
    pub multiplexer: MultiplexerConfig,
}

impl ServerConfig {
    /// Loads `path` (any format the `config` crate understands, TOML in
    /// practice), applies `GAMENET__SECTION__KEY` environment overrides and
    /// validates the result.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be positive".to_string(),
            ));
        }
        let smallest = HEADER_LEN + MAX_PAYLOAD_LEN;
        for (name, size) in [
            ("buffers.read_buffer_size", self.buffers.read_buffer_size),
            ("buffers.write_buffer_size", self.buffers.write_buffer_size),
        ] {
            if size < smallest {
                return Err(AppError::InvalidValue(format!(
                    "{} is {}, it must hold one maximum frame ({} bytes)",
                    name, size, smallest
                )));
            }
        }
        if self.multiplexer.poll_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "multiplexer.poll_timeout_ms must be positive".to_string(),
            ));
        }
        if !self.multiplexer.backend.is_available() {
            return Err(AppError::UnsupportedBackend(
                self.multiplexer.backend.name(),
            ));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }

    pub fn worker_count(&self) -> usize {
        match self.multiplexer.workers {
            0 => num_cpus::get(),
            n => n,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.multiplexer.poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.multiplexer.shutdown_timeout_ms)
    }
}
