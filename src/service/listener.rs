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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::multiplexer::Multiplexer;
use crate::network::{next_connection_id, ConnectionFactory};
use crate::{AppError, AppResult};

use super::Shutdown;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(1);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Accept loop feeding the multiplexer. Runs on the tokio runtime; once a
/// socket is registered the multiplexer workers own all its I/O.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    multiplexer: Arc<Multiplexer>,
    factory: Arc<dyn ConnectionFactory>,
    nodelay: bool,
}

impl Listener {
    /// Binding failure is fatal for the server.
    pub async fn bind(
        address: &str,
        multiplexer: Arc<Multiplexer>,
        factory: Arc<dyn ConnectionFactory>,
        nodelay: bool,
    ) -> AppResult<Listener> {
        let listener = TcpListener::bind(address).await.map_err(|source| {
            error!(
                "Failed to bind server to address: {} - Error: {}",
                address, source
            );
            AppError::Bind {
                address: address.to_string(),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);
        Ok(Listener {
            listener,
            local_addr,
            multiplexer,
            factory,
            nodelay,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts until the shutdown broadcast. A failed accept never ends the
    /// loop, it only backs off.
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut backoff = MIN_ACCEPT_BACKOFF;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("listener received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            backoff = MIN_ACCEPT_BACKOFF;
                            match self.admit(stream, peer) {
                                Ok(true) => {}
                                Ok(false) => debug!("connection from {} was not registered", peer),
                                Err(err) => warn!("failed to set up connection from {}: {}", peer, err),
                            }
                        }
                        Err(err) => {
                            error!(cause = %err, "failed to accept, retrying in {:?}", backoff);
                            tokio::select! {
                                _ = shutdown.recv() => break,
                                _ = time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                        }
                    }
                }
            }
        }
        info!("listener on {} stopped", self.local_addr);
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> AppResult<bool> {
        let stream = stream.into_std()?;
        stream.set_nonblocking(true)?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        let id = next_connection_id();
        debug!("accepted connection {} from {}", id, peer);
        let connection = Arc::new(self.factory.create(id, Box::new(stream), peer)?);
        Ok(self.multiplexer.register(connection))
    }
}
