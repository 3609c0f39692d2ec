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

//! Bastion-side pool binary.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

use contun::config::{PoolConfig, PoolMode};
use contun::dest::Dest;
use contun::logger;
use contun::pool;

/// Dials the hub with a pool of workers that serve tunnel sessions.
#[derive(Parser, Debug)]
#[clap(name = "contun-pool", version, about)]
struct Opts {
    /// Host of the hub's pool listener.
    #[clap(short = 'j', long, default_value = "127.0.0.1")]
    hub_host: String,

    /// Port of the hub's pool listener.
    #[clap(short = 'p', long)]
    hub_port: u16,

    /// Tunnel mode.
    #[clap(short = 'm', long, value_enum, default_value = "direct")]
    mode: PoolMode,

    /// Fixed target host; required in direct mode.
    #[clap(short = 't', long)]
    target_host: Option<String>,

    /// Fixed target port; required in direct mode.
    #[clap(short = 'T', long)]
    target_port: Option<u16>,

    /// Number of concurrent workers.
    #[clap(
        short = 'w',
        long,
        default_value_t = 4,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    workers: u32,

    /// Seconds to wait before redialling after a fatal session error.
    #[clap(short = 'r', long, default_value_t = 1.0)]
    retry_delay: f64,
}

fn usage_error(message: &str) -> ! {
    Opts::command()
        .error(clap::error::ErrorKind::ArgumentConflict, message)
        .exit()
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    logger::init_tracing()?;

    let target = match opts.mode {
        PoolMode::Direct => {
            let (Some(host), Some(port)) = (&opts.target_host, opts.target_port) else {
                usage_error("--target-host and --target-port are required in direct mode");
            };
            match Dest::from_host_port(host, port) {
                Ok(dest) => Some(dest),
                Err(err) => usage_error(&format!("invalid target: {err}")),
            }
        }
        PoolMode::Socks => {
            if opts.target_host.is_some() || opts.target_port.is_some() {
                usage_error("--target-host/--target-port are only permitted in direct mode");
            }
            None
        }
    };
    if !opts.retry_delay.is_finite() || opts.retry_delay < 0.0 {
        usage_error("--retry-delay must be a non-negative number of seconds");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in TERM_SIGNALS {
        flag::register(*signal, Arc::clone(&shutdown))
            .with_context(|| format!("failed to register signal {signal}"))?;
    }

    let config = PoolConfig {
        hub_host: opts.hub_host,
        hub_port: opts.hub_port,
        mode: opts.mode,
        target,
        workers: opts.workers as usize,
        retry_delay: Duration::from_secs_f64(opts.retry_delay),
    };
    pool::run(&config, &shutdown).context("pool supervisor failed")?;
    Ok(())
}
