// Copyright 2022 Ryan Seipp
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

//! Bastion-side pool: a supervisor owning W worker threads.
//!
//! Workers share nothing; each keeps its own control connection and target
//! connection, restarting itself in its own loop. The supervisor only owns
//! lifecycle handles and the shared cancellation flag.

mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::info;

use crate::config::PoolConfig;

/// Spawns the configured number of workers and joins them.
///
/// Returns once every worker has observed cancellation and exited, or
/// immediately with the error if a thread could not be spawned.
pub fn run(config: &PoolConfig, shutdown: &Arc<AtomicBool>) -> io::Result<()> {
    let hub_endpoint = format!("{}:{}", config.hub_host, config.hub_port);
    info!(
        workers = config.workers,
        hub = %hub_endpoint,
        mode = %config.mode,
        "pool supervisor starting"
    );
    let mut handles = Vec::with_capacity(config.workers);
    let spawned = (0..config.workers).try_for_each(|id| {
        let config = config.clone();
        let shutdown = Arc::clone(shutdown);
        thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker::run(id, &config, &shutdown))
            .map(|handle| handles.push(handle))
    });
    if spawned.is_err() {
        shutdown.store(true, Ordering::Relaxed);
    }
    for handle in handles {
        let _ = handle.join();
    }
    spawned?;
    info!("pool supervisor stopped");
    Ok(())
}
