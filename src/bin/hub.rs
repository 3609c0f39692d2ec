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

//! Jump-box hub binary.

use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

use contun::config::{HubConfig, Mode};
use contun::hub::Hub;
use contun::logger;

/// Multiplexes downstream clients onto a pool of bastion-dialled workers.
#[derive(Parser, Debug)]
#[clap(name = "contun-hub", version, about)]
struct Opts {
    /// Interface to listen on for downstream clients.
    #[clap(short = 'C', long, default_value = "127.0.0.1")]
    client_bind: IpAddr,

    /// Port to listen on for downstream clients.
    #[clap(short = 'c', long)]
    client_port: u16,

    /// Interface to listen on for pool workers.
    #[clap(short = 'P', long, default_value = "0.0.0.0")]
    pool_bind: IpAddr,

    /// Port to listen on for pool workers.
    #[clap(short = 'p', long)]
    pool_port: u16,

    /// Tunnel mode; auto adopts the first worker's declared mode.
    #[clap(short = 'm', long, value_enum, default_value = "auto")]
    mode: Mode,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    logger::init_tracing()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in TERM_SIGNALS {
        flag::register(*signal, Arc::clone(&shutdown))
            .with_context(|| format!("failed to register signal {signal}"))?;
    }

    let config = HubConfig {
        client_bind: opts.client_bind,
        client_port: opts.client_port,
        pool_bind: opts.pool_bind,
        pool_port: opts.pool_port,
        mode: opts.mode,
    };
    let hub = Hub::bind(&config).context("failed to bind listeners")?;
    hub.run(&shutdown).context("hub event loop failed")?;
    Ok(())
}
