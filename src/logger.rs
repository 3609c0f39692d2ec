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

//! Tracing bootstrap for the binaries.

use std::io::IsTerminal;

use anyhow::Context;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Configure and initialise the tracing subsystem.
///
/// Defaults to `info`; `RUST_LOG` directives refine it. Output goes to
/// stderr so tunnelled data on stdout pipelines stays clean.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
        .context("failed to init tracing")?;

    Ok(())
}
