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

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio::{runtime, signal};
use tracing::{debug, error, info, warn};

use crate::multiplexer::{Multiplexer, WorkerPool};
use crate::network::ConnectionFactory;
use crate::AppResult;

use super::{Listener, ServerConfig, ShutdownSignal};

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(5);

/// Owns the multiplexer and starts the pieces around it. Construction is
/// explicit: everything it needs comes from the config and the factory.
pub struct Server {
    config: ServerConfig,
    factory: Arc<dyn ConnectionFactory>,
    multiplexer: Arc<Multiplexer>,
}

impl Server {
    pub fn new(config: ServerConfig, factory: Arc<dyn ConnectionFactory>) -> AppResult<Self> {
        config.validate()?;
        let multiplexer = Multiplexer::new(
            config.multiplexer.backend,
            config.network.max_connection,
        )?;
        Ok(Self::with_multiplexer(
            config,
            factory,
            Arc::new(multiplexer),
        ))
    }

    /// Uses a prepared multiplexer, e.g. one over an injected backend.
    pub fn with_multiplexer(
        config: ServerConfig,
        factory: Arc<dyn ConnectionFactory>,
        multiplexer: Arc<Multiplexer>,
    ) -> Self {
        Server {
            config,
            factory,
            multiplexer,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    /// Starts the workers, binds the listener and spawns the accept loop on
    /// the current runtime.
    pub async fn start(self) -> AppResult<ServerHandle> {
        let workers = WorkerPool::start(
            self.multiplexer.clone(),
            self.config.worker_count(),
            self.config.poll_timeout(),
        )?;
        let listener = Listener::bind(
            &self.config.listen_address(),
            self.multiplexer.clone(),
            self.factory.clone(),
            self.config.network.nodelay,
        )
        .await?;
        let local_addr = listener.local_addr();

        let signal = ShutdownSignal::new();
        let accept_task = tokio::spawn(listener.run(signal.subscribe()));
        info!(
            "game server listening on {} with {} backend, {} workers",
            local_addr,
            self.multiplexer.backend_name(),
            workers.len()
        );

        Ok(ServerHandle {
            local_addr,
            multiplexer: self.multiplexer,
            workers: Some(workers),
            signal,
            accept_task: Some(accept_task),
            shutdown_timeout: self.config.shutdown_timeout(),
        })
    }

    /// Runs on its own runtime until Ctrl-C, then drains.
    pub fn run(self) -> AppResult<()> {
        // startup tokio runtime
        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
        rt.block_on(async move {
            let handle = self.start().await?;
            match signal::ctrl_c().await {
                Ok(()) => info!("get shutdown signal"),
                Err(err) => error!("failed to listen for ctrl-c: {}", err),
            }
            handle.shutdown().await;
            Ok(())
        })
    }
}

/// A running server. Dropping it without [`ServerHandle::shutdown`] stops the
/// listener and the workers but skips the drain.
pub struct ServerHandle {
    local_addr: SocketAddr,
    multiplexer: Arc<Multiplexer>,
    workers: Option<WorkerPool>,
    signal: ShutdownSignal,
    accept_task: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    /// Graceful shutdown sequence:
    /// 1. the listener stops accepting;
    /// 2. every connection is asked to disconnect, the workers tear them down;
    /// 3. wait for the registry to empty, at most `shutdown_timeout`;
    /// 4. stop and join the workers, then force-close whatever is left.
    ///
    /// Returns true when the registry drained in time.
    pub async fn shutdown(mut self) -> bool {
        self.signal.trigger();
        if let Some(accept_task) = self.accept_task.take() {
            if let Err(err) = accept_task.await {
                error!("accept task failed: {}", err);
            }
        }

        let asked = self.multiplexer.shutdown_connections();
        let deadline = Instant::now() + self.shutdown_timeout;
        let drained = loop {
            if self.multiplexer.connection_count() == 0 {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            time::sleep(DRAIN_CHECK_INTERVAL).await;
        };
        if !drained {
            warn!(
                "{} of {} connections still open after {:?}",
                self.multiplexer.connection_count(),
                asked,
                self.shutdown_timeout
            );
        }

        if let Some(workers) = self.workers.take() {
            if let Err(err) = tokio::task::spawn_blocking(move || workers.shutdown()).await {
                error!("stopping workers failed: {}", err);
            }
        }
        let forced = self.multiplexer.close_all();
        info!(
            "server on {} shut down, {} connections drained, {} forced",
            self.local_addr,
            asked - forced.min(asked),
            forced
        );
        drained
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.signal.trigger();
        debug!("server handle dropped");
    }
}
