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

//! Worker session loop
//!
//! Each worker owns one control connection to the hub and serves sessions
//! sequentially: HELLO, await REQUEST, dial the target, REPLY, splice until
//! the session ends, then read the next line. Blocking sockets with short
//! read timeouts keep every wait responsive to cancellation. Fatal session
//! errors close the hub socket and redial after the retry delay.

use std::convert::Infallible;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::buffer::MAX_BUFFER;
use crate::config::{Mode, PoolConfig, PoolMode};
use crate::dest::Dest;
use crate::proto::{self, status};

/// Timeout for dialling the hub or a target.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// The hub must answer HELLO within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Granularity of cancellation checks during blocking waits.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Bytes per read syscall while splicing.
const COPY_CHUNK: usize = 16 * 1024;

/// Why a session ended.
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("hub closed the control connection")]
    HubClosed,
    #[error("hub rejected handshake: {0:?}")]
    Rejected(String),
    #[error("protocol: {0}")]
    Protocol(#[from] proto::WireError),
    #[error("cancelled")]
    Cancelled,
}

/// Runs one worker until cancellation: dial, serve, redial on failure.
pub(super) fn run(id: usize, config: &PoolConfig, shutdown: &AtomicBool) {
    info!(worker = id, "worker started");
    while !shutdown.load(Ordering::Relaxed) {
        let err = match session(id, config, shutdown) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        if matches!(err, SessionError::Cancelled) {
            break;
        }
        debug!(worker = id, error = %err, "session ended");
        sleep_cancellable(config.retry_delay, shutdown);
    }
    debug!(worker = id, "worker exiting");
}

/// Serves one control connection. Only ever returns by failing; the error
/// says whether to redial or stop.
fn session(
    id: usize,
    config: &PoolConfig,
    shutdown: &AtomicBool,
) -> Result<Infallible, SessionError> {
    let hub = connect_host(&config.hub_host, config.hub_port, CONNECT_TIMEOUT)?;
    hub.set_nodelay(true)?;
    hub.set_read_timeout(Some(POLL_INTERVAL))?;

    let hello = proto::hello_line(Mode::from(config.mode), config.target.as_ref());
    (&hub).write_all(hello.as_bytes())?;

    let mut line_buf = Vec::new();
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let answer = read_line(&hub, &mut line_buf, Some(deadline), shutdown)?
        .ok_or(SessionError::HubClosed)?;
    if answer != proto::OK_LINE {
        return Err(SessionError::Rejected(answer));
    }
    debug!(worker = id, "registered with hub");

    loop {
        let line = read_line(&hub, &mut line_buf, None, shutdown)?
            .ok_or(SessionError::HubClosed)?;
        let dest = proto::parse_request(&line)?;

        if config.mode == PoolMode::Direct && Some(&dest) != config.target.as_ref() {
            warn!(worker = id, requested = %dest, "refusing undeclared destination");
            let reply = proto::reply_line(status::GENERAL, &Dest::unspecified());
            (&hub).write_all(reply.as_bytes())?;
            continue;
        }

        let target = match connect_host(&dest.addr, dest.port, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                let st = proto::status_for_dial_error(&err);
                info!(worker = id, dest = %dest, error = %err, status = st, "target dial failed");
                let reply = proto::reply_line(st, &Dest::unspecified());
                (&hub).write_all(reply.as_bytes())?;
                continue;
            }
        };
        target.set_nodelay(true)?;
        target.set_read_timeout(Some(POLL_INTERVAL))?;

        let bind = target
            .local_addr()
            .map(Dest::from_socket_addr)
            .unwrap_or_else(|_| Dest::unspecified());
        (&hub).write_all(proto::reply_line(status::SUCCESS, &bind).as_bytes())?;
        debug!(worker = id, dest = %dest, "session streaming");

        // Anything buffered past the REQUEST line is early payload.
        if !line_buf.is_empty() {
            let early = std::mem::take(&mut line_buf);
            (&target).write_all(&early)?;
        }

        splice(&hub, &target, shutdown);

        if shutdown.load(Ordering::Relaxed) {
            return Err(SessionError::Cancelled);
        }
        // The target leg drops here; the control connection is read again
        // for the next REQUEST. A hub that tore the pair down yields EOF.
    }
}

/// Resolves `host:port` and dials the first address that answers.
fn connect_host(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| io::Error::new(ErrorKind::HostUnreachable, err))?;
    let mut last = io::Error::from(ErrorKind::HostUnreachable);
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = err,
        }
    }
    Err(last)
}

/// Reads one control line, polling the shutdown flag between attempts.
///
/// `Ok(None)` means EOF. Bytes past the terminator stay in `buf`.
fn read_line(
    mut stream: &TcpStream,
    buf: &mut Vec<u8>,
    deadline: Option<Instant>,
    shutdown: &AtomicBool,
) -> Result<Option<String>, SessionError> {
    let mut chunk = [0u8; 512];
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)
                .map_err(|_| SessionError::Protocol(proto::WireError::Encoding))?;
            return Ok(Some(line));
        }
        if buf.len() >= MAX_BUFFER {
            return Err(SessionError::Protocol(proto::WireError::Overlong));
        }
        if shutdown.load(Ordering::Relaxed) {
            return Err(SessionError::Cancelled);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(SessionError::Io(io::Error::from(ErrorKind::TimedOut)));
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(None),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(ref err)
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(SessionError::Io(err)),
        }
    }
}

/// Copies bytes in both directions until the session ends.
///
/// A clean EOF on one direction is propagated as a write-shutdown to the
/// other leg and that direction keeps draining; a socket error aborts both
/// directions. Cancellation shuts both sockets down, which also unblocks a
/// stalled write on the opposite thread.
fn splice(hub: &TcpStream, target: &TcpStream, shutdown: &AtomicBool) {
    let abort = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| copy_direction(hub, target, shutdown, &abort));
        copy_direction(target, hub, shutdown, &abort);
    });
}

fn copy_direction(
    mut src: &TcpStream,
    mut dst: &TcpStream,
    shutdown: &AtomicBool,
    abort: &AtomicBool,
) {
    let mut chunk = [0u8; COPY_CHUNK];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            let _ = src.shutdown(Shutdown::Both);
            let _ = dst.shutdown(Shutdown::Both);
            return;
        }
        if abort.load(Ordering::Relaxed) {
            return;
        }
        match src.read(&mut chunk) {
            Ok(0) => {
                let _ = dst.shutdown(Shutdown::Write);
                return;
            }
            Ok(n) => {
                if dst.write_all(&chunk[..n]).is_err() {
                    abort.store(true, Ordering::Relaxed);
                    let _ = src.shutdown(Shutdown::Read);
                    return;
                }
            }
            Err(ref err)
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                abort.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
}

/// Sleeps for `total`, waking early if cancellation is raised.
fn sleep_cancellable(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
        let nap = deadline
            .saturating_duration_since(Instant::now())
            .min(Duration::from_millis(50));
        thread::sleep(nap);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn read_line_returns_lines_and_keeps_residual() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_read_timeout(Some(Duration::from_millis(10))).unwrap();

        (&server).write_all(b"OK\r\nREQUEST CONNECT ipv4 127.0.0.1 80\nrest").unwrap();
        let shutdown = AtomicBool::new(false);
        let mut buf = Vec::new();
        let line = read_line(&client, &mut buf, None, &shutdown).unwrap();
        assert_eq!(Some("OK".to_owned()), line);
        let line = read_line(&client, &mut buf, None, &shutdown).unwrap();
        assert_eq!(Some("REQUEST CONNECT ipv4 127.0.0.1 80".to_owned()), line);

        // The trailing payload may arrive in its own segment.
        let mut stream = &client;
        let deadline = Instant::now() + Duration::from_secs(2);
        while buf.len() < 4 && Instant::now() < deadline {
            let mut chunk = [0u8; 16];
            if let Ok(n) = stream.read(&mut chunk) {
                buf.extend_from_slice(&chunk[..n]);
            }
        }
        assert_eq!(b"rest".to_vec(), buf);
    }

    #[test]
    fn read_line_observes_eof_and_cancellation() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_read_timeout(Some(Duration::from_millis(10))).unwrap();

        let shutdown = AtomicBool::new(true);
        let mut buf = Vec::new();
        assert!(matches!(
            read_line(&client, &mut buf, None, &shutdown),
            Err(SessionError::Cancelled)
        ));

        let shutdown = AtomicBool::new(false);
        drop(server);
        assert_eq!(None, read_line(&client, &mut buf, None, &shutdown).unwrap());
    }

    #[test]
    fn sleep_cancellable_returns_early() {
        let shutdown = AtomicBool::new(true);
        let started = Instant::now();
        sleep_cancellable(Duration::from_secs(5), &shutdown);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
