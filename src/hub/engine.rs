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

//! Hub event loop & dispatcher
//!
//! A single-threaded readiness loop multiplexes the client listener, the
//! pool listener, and every live socket. All mutable state — the context
//! slab, the two FIFO queues, the committed mode — is touched only from
//! this loop, so nothing needs a lock. Sockets are drained to `WouldBlock`
//! on every readable event and queued output is flushed on writable events,
//! with interest recomputed whenever the out-buffer empties or fills.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, info, warn};

use crate::buffer::MAX_BUFFER;
use crate::config::{HubConfig, Mode};
use crate::proto::{self, status};
use crate::socks::{self, GreetingOutcome, RequestOutcome};

use super::context::{ClientState, Role, SocketCtx, WorkerState};

const CLIENT_LISTEN_TOKEN: Token = Token(usize::MAX);
const POOL_LISTEN_TOKEN: Token = Token(usize::MAX - 1);

/// Ceiling on a single poll wait, so cancellation is observed promptly.
const POLL_CEILING: Duration = Duration::from_millis(500);
/// A worker must complete HELLO within this window of connecting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bytes per read syscall.
const READ_CHUNK: usize = 16 * 1024;

/// How freshly read bytes are routed, derived from role and state.
enum IngestClass {
    /// Spurious bytes on an idle worker; keepalive noise.
    Ignore,
    /// Early client payload, held until streaming starts.
    Pending,
    /// Client control bytes for the SOCKS parser.
    ControlClient,
    /// Worker control bytes for the line parser.
    ControlWorker,
    /// Opaque stream payload for the paired socket.
    Forward,
}

/// The jump-box multiplexer: accepts clients and pool workers, pairs them
/// FIFO, relays the control exchange, then streams bytes between pairs.
#[derive(Debug)]
pub struct Hub {
    poll: Poll,
    client_listener: TcpListener,
    pool_listener: TcpListener,
    client_addr: SocketAddr,
    pool_addr: SocketAddr,
    contexts: Slab<SocketCtx>,
    idle_workers: VecDeque<(Token, u64)>,
    waiting_clients: VecDeque<(Token, u64)>,
    /// Committed mode; `None` only while auto and no worker has registered.
    active_mode: Option<Mode>,
    next_generation: u64,
}

impl Hub {
    /// Binds both listeners and prepares the engine.
    pub fn bind(config: &HubConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut client_listener =
            TcpListener::bind(SocketAddr::new(config.client_bind, config.client_port))?;
        let mut pool_listener =
            TcpListener::bind(SocketAddr::new(config.pool_bind, config.pool_port))?;
        poll.registry()
            .register(&mut client_listener, CLIENT_LISTEN_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut pool_listener, POOL_LISTEN_TOKEN, Interest::READABLE)?;
        let client_addr = client_listener.local_addr()?;
        let pool_addr = pool_listener.local_addr()?;
        let active_mode = match config.mode {
            Mode::Auto => None,
            mode => Some(mode),
        };
        info!(
            clients = %client_addr,
            pool = %pool_addr,
            mode = %config.mode,
            "hub listening"
        );
        Ok(Self {
            poll,
            client_listener,
            pool_listener,
            client_addr,
            pool_addr,
            contexts: Slab::new(),
            idle_workers: VecDeque::new(),
            waiting_clients: VecDeque::new(),
            active_mode,
            next_generation: 0,
        })
    }

    /// Address of the downstream client listener.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Address of the pool listener.
    pub fn pool_addr(&self) -> SocketAddr {
        self.pool_addr
    }

    /// Drives the event loop until `shutdown` is raised.
    pub fn run(mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_CEILING)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            for event in events.iter() {
                match event.token() {
                    CLIENT_LISTEN_TOKEN => self.accept_clients(),
                    POOL_LISTEN_TOKEN => self.accept_workers(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.flush_out(token);
                        }
                    }
                }
            }
            self.sweep_handshake_deadlines();
        }
        info!("hub shutting down");
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.client_listener.accept() {
                Ok((stream, addr)) => {
                    let state = match self.active_mode {
                        Some(Mode::Socks) => ClientState::AwaitGreeting,
                        Some(Mode::Direct) => ClientState::AwaitWorker,
                        _ => ClientState::AwaitMode,
                    };
                    self.next_generation += 1;
                    let generation = self.next_generation;
                    let entry = self.contexts.vacant_entry();
                    let token = Token(entry.key());
                    let mut ctx = SocketCtx::client(stream, generation, state);
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut ctx.stream, token, Interest::READABLE)
                    {
                        warn!(error = %err, "failed to register client socket");
                        continue;
                    }
                    entry.insert(ctx);
                    debug!(token = token.0, peer = %addr, "client accepted");
                    if state == ClientState::AwaitWorker {
                        self.waiting_clients.push_back((token, generation));
                        self.dispatch();
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(error = %err, "client accept failed");
                    return;
                }
            }
        }
    }

    fn accept_workers(&mut self) {
        loop {
            match self.pool_listener.accept() {
                Ok((stream, addr)) => {
                    self.next_generation += 1;
                    let generation = self.next_generation;
                    let entry = self.contexts.vacant_entry();
                    let token = Token(entry.key());
                    let mut ctx =
                        SocketCtx::worker(stream, generation, Instant::now() + HANDSHAKE_TIMEOUT);
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut ctx.stream, token, Interest::READABLE)
                    {
                        warn!(error = %err, "failed to register worker socket");
                        continue;
                    }
                    entry.insert(ctx);
                    debug!(token = token.0, peer = %addr, "worker connected");
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(error = %err, "pool accept failed");
                    return;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            let read_result = match self.contexts.get_mut(token.0) {
                Some(ctx) => ctx.stream.read(&mut scratch),
                None => return,
            };
            match read_result {
                Ok(0) => {
                    self.on_eof(token);
                    return;
                }
                Ok(n) => {
                    if !self.ingest(token, &scratch[..n]) {
                        return;
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(token = token.0, error = %err, "read failed");
                    self.teardown_pair(token, "read error");
                    return;
                }
            }
        }
    }

    /// Routes freshly read bytes. Returns false once `token` is gone.
    fn ingest(&mut self, token: Token, bytes: &[u8]) -> bool {
        let class = {
            let Some(ctx) = self.contexts.get(token.0) else {
                return false;
            };
            match &ctx.role {
                Role::Client { state, .. } => match state {
                    ClientState::AwaitMode
                    | ClientState::AwaitWorker
                    | ClientState::AwaitReply => IngestClass::Pending,
                    ClientState::AwaitGreeting | ClientState::AwaitRequest => {
                        IngestClass::ControlClient
                    }
                    ClientState::Stream => IngestClass::Forward,
                },
                Role::Worker { state, .. } => match state {
                    WorkerState::Idle => IngestClass::Ignore,
                    WorkerState::AwaitHello | WorkerState::AwaitReply => {
                        IngestClass::ControlWorker
                    }
                    WorkerState::Stream => IngestClass::Forward,
                },
            }
        };
        match class {
            IngestClass::Ignore => true,
            IngestClass::Pending => {
                let appended = self
                    .contexts
                    .get_mut(token.0)
                    .map_or(false, |ctx| ctx.pending.extend_capped(bytes, MAX_BUFFER));
                if !appended {
                    warn!(token = token.0, "pending buffer cap exceeded");
                    self.teardown_pair(token, "pending cap");
                    return false;
                }
                true
            }
            IngestClass::Forward => self.forward(token, bytes),
            IngestClass::ControlClient | IngestClass::ControlWorker => {
                let appended = self
                    .contexts
                    .get_mut(token.0)
                    .map_or(false, |ctx| ctx.in_buf.extend_capped(bytes, MAX_BUFFER));
                if !appended {
                    warn!(token = token.0, "control buffer cap exceeded");
                    self.teardown_pair(token, "control cap");
                    return false;
                }
                match class {
                    IngestClass::ControlClient => self.drive_client_control(token),
                    _ => self.drive_worker_control(token),
                }
            }
        }
    }

    /// Relays stream payload to the paired socket.
    fn forward(&mut self, token: Token, bytes: &[u8]) -> bool {
        let Some(peer) = self.contexts.get(token.0).and_then(|ctx| ctx.peer) else {
            self.teardown_pair(token, "stream without peer");
            return false;
        };
        let appended = self
            .contexts
            .get_mut(peer.0)
            .map_or(false, |ctx| ctx.out_buf.extend_capped(bytes, MAX_BUFFER));
        if !appended {
            warn!(token = token.0, "stream buffer cap exceeded");
            self.teardown_pair(token, "buffer cap");
            return false;
        }
        if !self.flush_out(peer) {
            return false;
        }
        self.contexts.contains(token.0)
    }

    /// Advances a client through the SOCKS5 stages as far as buffered bytes
    /// allow. Returns false once the client is gone.
    fn drive_client_control(&mut self, token: Token) -> bool {
        enum Step {
            Wait,
            FlushAndContinue,
            Enqueue(u64),
            Reject(Vec<u8>),
        }
        loop {
            let step = {
                let Some(ctx) = self.contexts.get_mut(token.0) else {
                    return false;
                };
                let generation = ctx.generation;
                let Role::Client { state, requested } = &mut ctx.role else {
                    return true;
                };
                match *state {
                    ClientState::AwaitGreeting => {
                        match socks::parse_greeting(ctx.in_buf.as_slice()) {
                            GreetingOutcome::Incomplete => Step::Wait,
                            GreetingOutcome::Accept { consumed } => {
                                ctx.in_buf.consume(consumed);
                                *state = ClientState::AwaitRequest;
                                if ctx
                                    .out_buf
                                    .extend_capped(&socks::method_selection(), MAX_BUFFER)
                                {
                                    Step::FlushAndContinue
                                } else {
                                    Step::Reject(Vec::new())
                                }
                            }
                            GreetingOutcome::Reject => {
                                Step::Reject(socks::no_acceptable_methods().to_vec())
                            }
                        }
                    }
                    ClientState::AwaitRequest => {
                        match socks::parse_request(ctx.in_buf.as_slice()) {
                            RequestOutcome::Incomplete => Step::Wait,
                            RequestOutcome::Connect { consumed, dest } => {
                                ctx.in_buf.consume(consumed);
                                debug!(token = token.0, dest = %dest, "connect requested");
                                *requested = Some(dest);
                                *state = ClientState::AwaitWorker;
                                // Bytes past the request are early payload.
                                let residual = ctx.in_buf.take_all();
                                if residual.is_empty()
                                    || ctx.pending.extend_capped(&residual, MAX_BUFFER)
                                {
                                    Step::Enqueue(generation)
                                } else {
                                    Step::Reject(Vec::new())
                                }
                            }
                            RequestOutcome::Fail { status } => {
                                Step::Reject(socks::failure_reply(status).to_vec())
                            }
                        }
                    }
                    _ => Step::Wait,
                }
            };
            match step {
                Step::Wait => return true,
                Step::FlushAndContinue => {
                    if !self.flush_out(token) {
                        return false;
                    }
                }
                Step::Enqueue(generation) => {
                    self.waiting_clients.push_back((token, generation));
                    self.dispatch();
                    return self.contexts.contains(token.0);
                }
                Step::Reject(reply) => {
                    if !reply.is_empty() {
                        if let Some(ctx) = self.contexts.get_mut(token.0) {
                            let _ = ctx.out_buf.extend_capped(&reply, MAX_BUFFER);
                        }
                    }
                    self.teardown_pair(token, "socks parse failure");
                    return false;
                }
            }
        }
    }

    /// Consumes control lines from a worker. Returns false once the worker
    /// is gone.
    fn drive_worker_control(&mut self, token: Token) -> bool {
        loop {
            let state = match self.contexts.get(token.0).and_then(SocketCtx::worker_state) {
                None => return false,
                Some(WorkerState::Idle) => {
                    // Keepalive noise between sessions; drop it.
                    if let Some(ctx) = self.contexts.get_mut(token.0) {
                        ctx.in_buf.clear();
                    }
                    return true;
                }
                Some(WorkerState::Stream) => return true,
                Some(state) => state,
            };
            let line = {
                let Some(ctx) = self.contexts.get_mut(token.0) else {
                    return false;
                };
                match proto::take_line(&mut ctx.in_buf) {
                    Ok(Some(line)) => line,
                    Ok(None) => return true,
                    Err(err) => {
                        warn!(token = token.0, error = %err, "bad control line");
                        self.teardown_pair(token, "bad control line");
                        return false;
                    }
                }
            };
            match state {
                WorkerState::AwaitHello => {
                    if !self.process_hello(token, &line) {
                        return false;
                    }
                }
                WorkerState::AwaitReply => return self.process_reply(token, &line),
                WorkerState::Idle | WorkerState::Stream => return true,
            }
        }
    }

    fn process_hello(&mut self, token: Token, line: &str) -> bool {
        let hello = match proto::parse_hello(line) {
            Ok(hello) => hello,
            Err(err) => {
                warn!(token = token.0, error = %err, "invalid HELLO");
                self.teardown_pair(token, "invalid HELLO");
                return false;
            }
        };
        match self.active_mode {
            None => {
                info!(mode = %hello.mode, "mode committed by first worker");
                self.active_mode = Some(hello.mode);
                self.commit_mode(hello.mode);
            }
            Some(active) if active != hello.mode => {
                warn!(
                    token = token.0,
                    declared = %hello.mode,
                    active = %active,
                    "worker mode mismatch"
                );
                self.teardown_pair(token, "mode mismatch");
                return false;
            }
            Some(_) => {}
        }
        let generation = {
            let Some(ctx) = self.contexts.get_mut(token.0) else {
                return false;
            };
            let Role::Worker {
                state,
                mode,
                declared,
                ..
            } = &mut ctx.role
            else {
                return false;
            };
            *state = WorkerState::Idle;
            *mode = Some(hello.mode);
            *declared = hello.declared;
            let ok = format!("{}\n", proto::OK_LINE);
            if !ctx.out_buf.extend_capped(ok.as_bytes(), MAX_BUFFER) {
                return false;
            }
            ctx.generation
        };
        if !self.flush_out(token) {
            return false;
        }
        debug!(token = token.0, "worker registered");
        self.idle_workers.push_back((token, generation));
        self.dispatch();
        self.contexts.contains(token.0)
    }

    /// Unparks clients that arrived before the first worker committed the
    /// active mode.
    fn commit_mode(&mut self, mode: Mode) {
        let parked: Vec<(Token, u64)> = self
            .contexts
            .iter()
            .filter(|(_, ctx)| ctx.client_state() == Some(ClientState::AwaitMode))
            .map(|(key, ctx)| (Token(key), ctx.generation))
            .collect();
        for (token, generation) in parked {
            match mode {
                Mode::Socks => {
                    let mut overflow = false;
                    if let Some(ctx) = self.contexts.get_mut(token.0) {
                        if let Role::Client { state, .. } = &mut ctx.role {
                            *state = ClientState::AwaitGreeting;
                        }
                        let stashed = ctx.pending.take_all();
                        overflow =
                            !stashed.is_empty() && !ctx.in_buf.extend_capped(&stashed, MAX_BUFFER);
                    }
                    if overflow {
                        self.teardown_pair(token, "buffer cap");
                        continue;
                    }
                    self.drive_client_control(token);
                }
                Mode::Direct => {
                    if let Some(ctx) = self.contexts.get_mut(token.0) {
                        if let Role::Client { state, .. } = &mut ctx.role {
                            *state = ClientState::AwaitWorker;
                        }
                    }
                    self.waiting_clients.push_back((token, generation));
                }
                Mode::Auto => {}
            }
        }
    }

    fn process_reply(&mut self, worker: Token, line: &str) -> bool {
        let reply = match proto::parse_reply(line) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(token = worker.0, error = %err, "invalid REPLY");
                self.teardown_pair(worker, "invalid REPLY");
                return false;
            }
        };
        let Some(client) = self.contexts.get(worker.0).and_then(|ctx| ctx.peer) else {
            self.teardown_pair(worker, "REPLY without pairing");
            return false;
        };
        if reply.status != status::SUCCESS {
            info!(
                worker = worker.0,
                status = reply.status,
                "worker reported dial failure"
            );
            self.fail_pair(worker, client, reply.status);
            return false;
        }

        // Success: switch both legs to streaming. The client's early bytes
        // go out first, strictly before anything it sends from now on.
        let socks_mode = self.active_mode == Some(Mode::Socks);
        let (pending, client_cap_hit) = {
            let Some(ctx) = self.contexts.get_mut(client.0) else {
                self.teardown_pair(worker, "peer vanished");
                return false;
            };
            if let Role::Client { state, .. } = &mut ctx.role {
                *state = ClientState::Stream;
            }
            let mut cap_hit = false;
            if socks_mode {
                let reply_bytes = socks::success_reply(&reply.bind);
                cap_hit = !ctx.out_buf.extend_capped(&reply_bytes, MAX_BUFFER);
            }
            (ctx.pending.take_all(), cap_hit)
        };
        if client_cap_hit {
            self.teardown_pair(client, "buffer cap");
            return false;
        }
        let (leftover, worker_cap_hit) = {
            let Some(ctx) = self.contexts.get_mut(worker.0) else {
                return false;
            };
            if let Role::Worker { state, .. } = &mut ctx.role {
                *state = WorkerState::Stream;
            }
            let leftover = ctx.in_buf.take_all();
            let cap_hit = !ctx.out_buf.extend_capped(&pending, MAX_BUFFER);
            (leftover, cap_hit)
        };
        if worker_cap_hit {
            self.teardown_pair(worker, "buffer cap");
            return false;
        }
        if !leftover.is_empty() {
            let appended = self
                .contexts
                .get_mut(client.0)
                .map_or(false, |ctx| ctx.out_buf.extend_capped(&leftover, MAX_BUFFER));
            if !appended {
                self.teardown_pair(worker, "buffer cap");
                return false;
            }
        }
        debug!(client = client.0, worker = worker.0, "session streaming");
        if !self.flush_out(worker) {
            return false;
        }
        if !self.flush_out(client) {
            return false;
        }
        true
    }

    /// Reports a failed session to the client and closes the pair. The
    /// worker is never reused mid-session; the pool redials to replace it.
    fn fail_pair(&mut self, worker: Token, client: Token, reply_status: u8) {
        if self.active_mode == Some(Mode::Socks) {
            if let Some(ctx) = self.contexts.get_mut(client.0) {
                let reply = socks::failure_reply(reply_status);
                let _ = ctx.out_buf.extend_capped(&reply, MAX_BUFFER);
            }
        }
        self.teardown_pair(worker, "session failed");
    }

    /// Pairs idle workers with waiting clients, FIFO on both sides.
    fn dispatch(&mut self) {
        loop {
            let Some(worker) = self.pop_valid_idle() else {
                break;
            };
            let Some(client) = self.pop_valid_waiting() else {
                let generation = self.contexts[worker.0].generation;
                self.idle_workers.push_front((worker, generation));
                break;
            };
            let dest = match self.active_mode {
                Some(Mode::Socks) => self.contexts.get(client.0).and_then(|ctx| match &ctx.role {
                    Role::Client { requested, .. } => requested.clone(),
                    Role::Worker { .. } => None,
                }),
                Some(Mode::Direct) => self.contexts.get(worker.0).and_then(|ctx| match &ctx.role {
                    Role::Worker { declared, .. } => declared.clone(),
                    Role::Client { .. } => None,
                }),
                _ => None,
            };
            let Some(dest) = dest else {
                warn!(client = client.0, "no destination available for pairing");
                self.teardown_pair(client, "no destination");
                let generation = self.contexts[worker.0].generation;
                self.idle_workers.push_front((worker, generation));
                continue;
            };
            debug!(client = client.0, worker = worker.0, dest = %dest, "pairing session");
            if let Some(ctx) = self.contexts.get_mut(client.0) {
                ctx.peer = Some(worker);
                if let Role::Client { state, .. } = &mut ctx.role {
                    *state = ClientState::AwaitReply;
                }
            }
            if let Some(ctx) = self.contexts.get_mut(worker.0) {
                ctx.peer = Some(client);
                if let Role::Worker { state, .. } = &mut ctx.role {
                    *state = WorkerState::AwaitReply;
                }
                let line = proto::request_line(&dest);
                let _ = ctx.out_buf.extend_capped(line.as_bytes(), MAX_BUFFER);
            }
            self.flush_out(worker);
        }
    }

    fn pop_valid_idle(&mut self) -> Option<Token> {
        while let Some((token, generation)) = self.idle_workers.pop_front() {
            let valid = self.contexts.get(token.0).map_or(false, |ctx| {
                ctx.generation == generation
                    && ctx.peer.is_none()
                    && ctx.worker_state() == Some(WorkerState::Idle)
            });
            if valid {
                return Some(token);
            }
        }
        None
    }

    fn pop_valid_waiting(&mut self) -> Option<Token> {
        while let Some((token, generation)) = self.waiting_clients.pop_front() {
            let valid = self.contexts.get(token.0).map_or(false, |ctx| {
                ctx.generation == generation
                    && ctx.peer.is_none()
                    && ctx.client_state() == Some(ClientState::AwaitWorker)
            });
            if valid {
                return Some(token);
            }
        }
        None
    }

    /// Writes queued output until it drains or the socket pushes back.
    /// Returns false once `token` is gone.
    fn flush_out(&mut self, token: Token) -> bool {
        loop {
            let write_result = {
                let Some(ctx) = self.contexts.get_mut(token.0) else {
                    return false;
                };
                if ctx.out_buf.is_empty() {
                    break;
                }
                ctx.stream.write(ctx.out_buf.as_slice())
            };
            match write_result {
                Ok(0) => {
                    self.teardown_pair(token, "write stalled");
                    return false;
                }
                Ok(n) => {
                    if let Some(ctx) = self.contexts.get_mut(token.0) {
                        ctx.out_buf.consume(n);
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(token = token.0, error = %err, "write failed");
                    self.teardown_pair(token, "write error");
                    return false;
                }
            }
        }
        self.update_interest(token);
        true
    }

    fn update_interest(&mut self, token: Token) {
        let registry = self.poll.registry();
        if let Some(ctx) = self.contexts.get_mut(token.0) {
            let desired = ctx.desired_interest();
            if desired != ctx.interest
                && registry.reregister(&mut ctx.stream, token, desired).is_ok()
            {
                ctx.interest = desired;
            }
        }
    }

    fn on_eof(&mut self, token: Token) {
        let Some(ctx) = self.contexts.get(token.0) else {
            return;
        };
        match (&ctx.role, ctx.peer) {
            (
                Role::Worker {
                    state: WorkerState::AwaitReply,
                    ..
                },
                Some(client),
            ) => {
                debug!(token = token.0, "worker lost before REPLY");
                self.fail_pair(token, client, status::GENERAL);
            }
            _ => self.teardown_pair(token, "eof"),
        }
    }

    /// Closes a socket and its peer, exactly once each. The peer link is
    /// nulled before the second close so the cycle cannot recurse.
    fn teardown_pair(&mut self, token: Token, why: &'static str) {
        let Some(ctx) = self.contexts.get_mut(token.0) else {
            return;
        };
        let peer = ctx.peer.take();
        debug!(token = token.0, why, "closing");
        self.close_single(token);
        if let Some(peer) = peer {
            if let Some(peer_ctx) = self.contexts.get_mut(peer.0) {
                peer_ctx.peer = None;
            }
            self.close_single(peer);
        }
    }

    fn close_single(&mut self, token: Token) {
        if let Some(mut ctx) = self.contexts.try_remove(token.0) {
            if !ctx.out_buf.is_empty() {
                flush_remaining(&mut ctx.stream, ctx.out_buf.as_slice());
            }
            let _ = self.poll.registry().deregister(&mut ctx.stream);
        }
    }

    /// Closes workers that connected but never finished HELLO in time.
    fn sweep_handshake_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .contexts
            .iter()
            .filter_map(|(key, ctx)| match &ctx.role {
                Role::Worker {
                    state: WorkerState::AwaitHello,
                    deadline,
                    ..
                } if *deadline <= now => Some(Token(key)),
                _ => None,
            })
            .collect();
        for token in expired {
            warn!(token = token.0, "worker handshake timed out");
            self.teardown_pair(token, "handshake timeout");
        }
    }
}

/// Best-effort synchronous drain used while closing a socket.
fn flush_remaining(stream: &mut TcpStream, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return,
            Ok(n) => bytes = &bytes[n..],
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}
