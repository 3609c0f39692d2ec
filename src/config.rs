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

//! Runtime configuration records
//!
//! The binaries parse flags and hand these records to the engine; tests
//! construct them directly (typically with port 0 to get ephemeral binds).

use core::fmt::Display;
use std::net::IpAddr;
use std::time::Duration;

use crate::dest::Dest;

/// Tunnel mode.
///
/// Process-wide on the hub. Under `Auto` the hub adopts the mode declared
/// by the first worker HELLO and locks it for the process lifetime. The
/// pool side only ever runs `Direct` or `Socks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Adopt the first worker's declared mode.
    Auto,
    /// Raw TCP relay to the worker's fixed destination.
    Direct,
    /// SOCKS5 front end; destination chosen per session.
    Socks,
}

impl Mode {
    /// Wire name of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Direct => "direct",
            Mode::Socks => "socks",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool-side tunnel mode.
///
/// The pool never runs `auto`, so its CLI surface carries its own
/// two-variant enum rather than the hub's [`Mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PoolMode {
    /// Raw TCP relay to the fixed declared destination.
    Direct,
    /// Per-session destinations tunnelled from the hub's SOCKS front end.
    Socks,
}

impl PoolMode {
    /// Wire name of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Direct => "direct",
            PoolMode::Socks => "socks",
        }
    }
}

impl Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PoolMode> for Mode {
    fn from(mode: PoolMode) -> Self {
        match mode {
            PoolMode::Direct => Mode::Direct,
            PoolMode::Socks => Mode::Socks,
        }
    }
}

/// Parsed configuration of the jump-box hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interface for the downstream client listener.
    pub client_bind: IpAddr,
    /// Port for the downstream client listener.
    pub client_port: u16,
    /// Interface for the pool (worker) listener.
    pub pool_bind: IpAddr,
    /// Port for the pool (worker) listener.
    pub pool_port: u16,
    /// Mode, or `Auto` to adopt the first worker's.
    pub mode: Mode,
}

/// Parsed configuration of the bastion-side pool supervisor.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Host of the hub's pool listener.
    pub hub_host: String,
    /// Port of the hub's pool listener.
    pub hub_port: u16,
    /// Mode this pool's workers declare to the hub.
    pub mode: PoolMode,
    /// Fixed target; required in direct mode, absent in socks mode.
    pub target: Option<Dest>,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Pause between redial attempts after a fatal session error.
    pub retry_delay: Duration,
}
