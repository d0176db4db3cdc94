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

use std::any::type_name;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::multiplexer::Multiplexer;
use crate::AppResult;

const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// represent a running worker
#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

/// Fixed pool of OS threads looping `poll` → `dispatch` over one multiplexer.
#[derive(Debug)]
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    multiplexer: Arc<Multiplexer>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn start(
        multiplexer: Arc<Multiplexer>,
        num_workers: usize,
        poll_timeout: Duration,
    ) -> AppResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut pool = WorkerPool {
            running: running.clone(),
            multiplexer: multiplexer.clone(),
            workers: Vec::with_capacity(num_workers),
        };

        for id in 0..num_workers.max(1) {
            let running = running.clone();
            let multiplexer = multiplexer.clone();
            // a failed spawn drops `pool`, which stops the ones already running
            let handle = thread::Builder::new()
                .name(format!("gamenet-worker-{id}"))
                .spawn(move || Self::run_worker(id, running, multiplexer, poll_timeout))?;
            pool.workers.push(Worker { id, handle });
        }
        info!(
            "started {} workers on the {} backend",
            pool.workers.len(),
            multiplexer.backend_name()
        );
        Ok(pool)
    }

    fn run_worker(
        id: usize,
        running: Arc<AtomicBool>,
        multiplexer: Arc<Multiplexer>,
        poll_timeout: Duration,
    ) {
        debug!("Worker {id} started");
        while running.load(Ordering::SeqCst) {
            match multiplexer.poll(Some(poll_timeout)) {
                Ok(ready) => multiplexer.dispatch(ready),
                Err(err) => {
                    error!("Worker {id} poll failed: {err}");
                    thread::sleep(POLL_ERROR_BACKOFF);
                }
            }
        }
        debug!("Worker {id} shutting down");
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stops every worker after its in-flight dispatch and joins it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.multiplexer.halt();
        for worker in self.workers.drain(..) {
            if let Err(payload) = worker.handle.join() {
                Self::log_worker_panic(worker.id, payload);
            }
        }
        debug!("all workers stopped");
    }

    fn log_worker_panic(worker_id: usize, payload: Box<dyn std::any::Any + Send>) {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "Worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
