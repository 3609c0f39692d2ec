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

//! Per-socket contexts
//!
//! One record per open hub socket. The peer link is a token, never an
//! owning handle: the slab is the single owner and teardown nulls the link
//! before the second close, so the A↔B cycle cannot double-free or recurse.

use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::buffer::StreamBuf;
use crate::config::Mode;
use crate::dest::Dest;

/// Client-side protocol stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Parked until the active mode is committed (auto, no worker yet).
    AwaitMode,
    /// Expecting the SOCKS5 greeting.
    AwaitGreeting,
    /// Greeting done, expecting the CONNECT request.
    AwaitRequest,
    /// Queued for pairing with an idle worker.
    AwaitWorker,
    /// REQUEST sent; waiting on the worker's REPLY.
    AwaitReply,
    /// Opaque byte relay.
    Stream,
}

/// Worker-side protocol stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Connected, HELLO not yet received.
    AwaitHello,
    /// Registered and available for dispatch.
    Idle,
    /// REQUEST sent; waiting on REPLY.
    AwaitReply,
    /// Opaque byte relay.
    Stream,
}

/// What kind of socket a context wraps, with its role-specific state.
#[derive(Debug)]
pub enum Role {
    /// A downstream client connection.
    Client {
        /// Protocol stage.
        state: ClientState,
        /// Destination extracted from the SOCKS CONNECT.
        requested: Option<Dest>,
    },
    /// A pool worker control connection.
    Worker {
        /// Protocol stage.
        state: WorkerState,
        /// Mode declared in HELLO.
        mode: Option<Mode>,
        /// Fixed destination declared by direct-mode workers.
        declared: Option<Dest>,
        /// HELLO must arrive before this instant.
        deadline: Instant,
    },
}

/// State for one open socket on the hub.
#[derive(Debug)]
pub struct SocketCtx {
    /// The nonblocking stream.
    pub stream: TcpStream,
    /// Stamp distinguishing this context from earlier occupants of the
    /// same slab slot; queues validate it on pop.
    pub generation: u64,
    /// Paired counterpart, if any.
    pub peer: Option<Token>,
    /// Bytes read but not yet consumed by a parser.
    pub in_buf: StreamBuf,
    /// Bytes queued for write.
    pub out_buf: StreamBuf,
    /// Client bytes arriving before streaming starts; replayed to the
    /// worker as the first stream payload.
    pub pending: StreamBuf,
    /// Role and protocol stage.
    pub role: Role,
    /// Interest currently registered with the poller.
    pub interest: Interest,
}

impl SocketCtx {
    /// Context for a freshly accepted client.
    pub fn client(stream: TcpStream, generation: u64, state: ClientState) -> Self {
        Self {
            stream,
            generation,
            peer: None,
            in_buf: StreamBuf::new(),
            out_buf: StreamBuf::new(),
            pending: StreamBuf::new(),
            role: Role::Client {
                state,
                requested: None,
            },
            interest: Interest::READABLE,
        }
    }

    /// Context for a freshly accepted worker.
    pub fn worker(stream: TcpStream, generation: u64, deadline: Instant) -> Self {
        Self {
            stream,
            generation,
            peer: None,
            in_buf: StreamBuf::new(),
            out_buf: StreamBuf::new(),
            pending: StreamBuf::new(),
            role: Role::Worker {
                state: WorkerState::AwaitHello,
                mode: None,
                declared: None,
                deadline,
            },
            interest: Interest::READABLE,
        }
    }

    /// Interest this socket should be registered with right now.
    pub fn desired_interest(&self) -> Interest {
        if self.out_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Client stage, if this is a client.
    pub fn client_state(&self) -> Option<ClientState> {
        match &self.role {
            Role::Client { state, .. } => Some(*state),
            Role::Worker { .. } => None,
        }
    }

    /// Worker stage, if this is a worker.
    pub fn worker_state(&self) -> Option<WorkerState> {
        match &self.role {
            Role::Worker { state, .. } => Some(*state),
            Role::Client { .. } => None,
        }
    }
}
