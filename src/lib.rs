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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! contun is a TCP tunnel with the listen topology inverted: the isolated
//! bastion host dials *out* to a public jump box, pre-establishing a pool
//! of worker connections, and the jump-box hub multiplexes downstream
//! clients onto those workers. Each pairing exchanges a short line-oriented
//! control handshake, then turns into an opaque bidirectional byte pipe.
//!
//! The [`hub`] runs a single-threaded readiness loop over all sockets; the
//! [`pool`] supervises blocking worker threads. Both are driven from the
//! `contun-hub` and `contun-pool` binaries and can be embedded directly,
//! which is how the integration tests spin entire tunnels over loopback.

pub mod buffer;
pub mod config;
pub mod dest;
pub mod hub;
pub mod logger;
pub mod pool;
pub mod proto;
pub mod socks;
