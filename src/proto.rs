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

//! Control wire protocol
//!
//! Line-oriented exchange between hub and pool workers, `\n`-terminated
//! (`\r\n` tolerated), fields separated by single spaces. Lines flow only
//! before a pairing enters streaming; afterwards both legs are opaque byte
//! pipes and nothing here applies.
//!
//! Address fields are plain text when the host is printable ASCII; hosts
//! that could confuse the tokenizer travel as `b64:<base64>`. Both forms
//! are accepted on ingress.

use std::io;

use base64::prelude::{Engine as _, BASE64_STANDARD};

use crate::buffer::{StreamBuf, MAX_BUFFER};
use crate::config::Mode;
use crate::dest::{AddrType, Dest, DestError};

/// Protocol version carried in HELLO.
pub const PROTO_VERSION: &str = "1";

/// Handshake acknowledgement line.
pub const OK_LINE: &str = "OK";

/// REPLY status codes, following SOCKS5 reply semantics.
pub mod status {
    /// Success.
    pub const SUCCESS: u8 = 0;
    /// General failure.
    pub const GENERAL: u8 = 1;
    /// Network unreachable.
    pub const NET_UNREACHABLE: u8 = 3;
    /// Host unreachable, no route, timeout, or name resolution failure.
    pub const HOST_UNREACHABLE: u8 = 4;
    /// Connection refused.
    pub const REFUSED: u8 = 5;
    /// Command not supported.
    pub const CMD_UNSUPPORTED: u8 = 7;
    /// Address type not supported.
    pub const ATYPE_UNSUPPORTED: u8 = 8;
}

/// Failures while reading or interpreting control lines.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// More than `MAX_BUFFER` bytes accumulated without a terminator.
    #[error("control line exceeds maximum length without terminator")]
    Overlong,
    /// A control line was not valid UTF-8.
    #[error("control line is not valid UTF-8")]
    Encoding,
    /// A line did not match its expected shape.
    #[error("malformed {0} line")]
    Malformed(&'static str),
    /// HELLO carried a version other than [`PROTO_VERSION`].
    #[error("unsupported protocol version")]
    Version,
    /// An address field failed destination validation.
    #[error("bad address field: {0}")]
    Address(#[from] DestError),
    /// A `b64:` address field did not decode.
    #[error("bad base64 address field")]
    Base64,
}

/// A parsed worker HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Mode the worker runs in; `Direct` or `Socks`.
    pub mode: Mode,
    /// Fixed destination declared by direct-mode workers.
    pub declared: Option<Dest>,
}

/// A parsed worker REPLY (or legacy ERR).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// SOCKS5-style status; 0 is success.
    pub status: u8,
    /// Bind address supplied by the worker; `0.0.0.0:0` on failure.
    pub bind: Dest,
}

/// Extracts one terminated line from `buf`, stripping the terminator.
///
/// Returns `Ok(None)` while no full line is present. Errors once
/// `MAX_BUFFER` bytes accumulate without a terminator; the caller closes
/// the connection.
pub fn take_line(buf: &mut StreamBuf) -> Result<Option<String>, WireError> {
    let slice = buf.as_slice();
    match slice.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut end = pos;
            if end > 0 && slice[end - 1] == b'\r' {
                end -= 1;
            }
            let line = std::str::from_utf8(&slice[..end])
                .map_err(|_| WireError::Encoding)?
                .to_owned();
            buf.consume(pos + 1);
            Ok(Some(line))
        }
        None if buf.len() >= MAX_BUFFER => Err(WireError::Overlong),
        None => Ok(None),
    }
}

/// Parses a `HELLO` line.
pub fn parse_hello(line: &str) -> Result<Hello, WireError> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < 3 || fields[0] != "HELLO" {
        return Err(WireError::Malformed("HELLO"));
    }
    if fields[1] != PROTO_VERSION {
        return Err(WireError::Version);
    }
    match fields[2] {
        "socks" if fields.len() == 3 => Ok(Hello {
            mode: Mode::Socks,
            declared: None,
        }),
        "direct" if fields.len() == 7 && fields[3] == "DEST" => {
            let dest = parse_dest_fields(fields[4], fields[5], fields[6], "HELLO")?;
            Ok(Hello {
                mode: Mode::Direct,
                declared: Some(dest),
            })
        }
        _ => Err(WireError::Malformed("HELLO")),
    }
}

/// Parses a `REQUEST CONNECT` line.
pub fn parse_request(line: &str) -> Result<Dest, WireError> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() != 5 || fields[0] != "REQUEST" || fields[1] != "CONNECT" {
        return Err(WireError::Malformed("REQUEST"));
    }
    parse_dest_fields(fields[2], fields[3], fields[4], "REQUEST")
}

/// Parses a `REPLY` line; `ERR <reason>` is accepted as a general failure.
pub fn parse_reply(line: &str) -> Result<Reply, WireError> {
    if line == "ERR" || line.starts_with("ERR ") {
        return Ok(Reply {
            status: status::GENERAL,
            bind: Dest::unspecified(),
        });
    }
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() != 5 || fields[0] != "REPLY" {
        return Err(WireError::Malformed("REPLY"));
    }
    let status: u8 = fields[1]
        .parse()
        .map_err(|_| WireError::Malformed("REPLY"))?;
    let atype = AddrType::from_wire(fields[2]).ok_or(WireError::Malformed("REPLY"))?;
    let addr = decode_addr_field(fields[3])?;
    let port: u16 = fields[4]
        .parse()
        .map_err(|_| WireError::Malformed("REPLY"))?;
    let bind = Dest::new_bind(atype, &addr, port)?;
    Ok(Reply { status, bind })
}

/// Encodes a worker HELLO line, terminator included.
pub fn hello_line(mode: Mode, declared: Option<&Dest>) -> String {
    match declared {
        Some(dest) => format!(
            "HELLO {} {} DEST {} {} {}\n",
            PROTO_VERSION,
            mode,
            dest.atype.as_str(),
            encode_addr_field(&dest.addr),
            dest.port
        ),
        None => format!("HELLO {} {}\n", PROTO_VERSION, mode),
    }
}

/// Encodes a hub REQUEST line, terminator included.
pub fn request_line(dest: &Dest) -> String {
    format!(
        "REQUEST CONNECT {} {} {}\n",
        dest.atype.as_str(),
        encode_addr_field(&dest.addr),
        dest.port
    )
}

/// Encodes a worker REPLY line, terminator included.
pub fn reply_line(status: u8, bind: &Dest) -> String {
    format!(
        "REPLY {} {} {} {}\n",
        status,
        bind.atype.as_str(),
        encode_addr_field(&bind.addr),
        bind.port
    )
}

fn parse_dest_fields(
    atype: &str,
    addr: &str,
    port: &str,
    what: &'static str,
) -> Result<Dest, WireError> {
    let atype = AddrType::from_wire(atype).ok_or(WireError::Malformed(what))?;
    let addr = decode_addr_field(addr)?;
    let port: u16 = port.parse().map_err(|_| WireError::Malformed(what))?;
    Ok(Dest::new(atype, &addr, port)?)
}

/// Renders an address for a wire field, wrapping hosts the tokenizer could
/// not carry verbatim.
pub fn encode_addr_field(addr: &str) -> String {
    let verbatim = !addr.is_empty()
        && !addr.starts_with("b64:")
        && addr.bytes().all(|b| b.is_ascii_graphic());
    if verbatim {
        addr.to_owned()
    } else {
        format!("b64:{}", BASE64_STANDARD.encode(addr))
    }
}

/// Decodes a wire address field, plain or `b64:`-wrapped.
pub fn decode_addr_field(field: &str) -> Result<String, WireError> {
    match field.strip_prefix("b64:") {
        Some(encoded) => {
            let raw = BASE64_STANDARD
                .decode(encoded)
                .map_err(|_| WireError::Base64)?;
            String::from_utf8(raw).map_err(|_| WireError::Base64)
        }
        None => Ok(field.to_owned()),
    }
}

/// Maps a target-dial failure to its REPLY status.
pub fn status_for_dial_error(err: &io::Error) -> u8 {
    use io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => status::REFUSED,
        ErrorKind::NetworkUnreachable => status::NET_UNREACHABLE,
        ErrorKind::HostUnreachable | ErrorKind::TimedOut => status::HOST_UNREACHABLE,
        _ => status::GENERAL,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::StreamBuf;
    use crate::dest::AddrType;

    fn buf_with(bytes: &[u8]) -> StreamBuf {
        let mut buf = StreamBuf::new();
        assert!(buf.extend_capped(bytes, MAX_BUFFER));
        buf
    }

    #[test]
    fn take_line_handles_both_terminators() {
        let mut buf = buf_with(b"OK\r\nREPLY 0 ipv4 0.0.0.0 0\npartial");
        assert_eq!(Some("OK".to_owned()), take_line(&mut buf).unwrap());
        assert_eq!(
            Some("REPLY 0 ipv4 0.0.0.0 0".to_owned()),
            take_line(&mut buf).unwrap()
        );
        assert_eq!(None, take_line(&mut buf).unwrap());
        assert_eq!(b"partial", buf.as_slice());
    }

    #[test]
    fn take_line_rejects_unterminated_overflow() {
        let mut buf = StreamBuf::new();
        assert!(buf.extend_capped(&vec![b'a'; MAX_BUFFER], MAX_BUFFER));
        assert!(matches!(take_line(&mut buf), Err(WireError::Overlong)));
    }

    #[test]
    fn hello_round_trips_socks() {
        let line = hello_line(Mode::Socks, None);
        assert_eq!("HELLO 1 socks\n", line);
        let hello = parse_hello(line.trim_end()).unwrap();
        assert_eq!(Mode::Socks, hello.mode);
        assert_eq!(None, hello.declared);
    }

    #[test]
    fn hello_round_trips_direct_dest() {
        let dest = Dest::new(AddrType::Ipv4, "10.0.0.5", 22).unwrap();
        let line = hello_line(Mode::Direct, Some(&dest));
        assert_eq!("HELLO 1 direct DEST ipv4 10.0.0.5 22\n", line);
        let hello = parse_hello(line.trim_end()).unwrap();
        assert_eq!(Mode::Direct, hello.mode);
        assert_eq!(Some(dest), hello.declared);
    }

    #[test]
    fn hello_rejects_bad_version_and_shape() {
        assert!(matches!(parse_hello("HELLO 2 socks"), Err(WireError::Version)));
        assert!(parse_hello("HELLO 1 direct").is_err());
        assert!(parse_hello("HELLO 1 socks extra").is_err());
        assert!(parse_hello("EHLO 1 socks").is_err());
    }

    #[test]
    fn request_round_trips_domain() {
        let dest = Dest::new(AddrType::Domain, "internal.example", 8443).unwrap();
        let line = request_line(&dest);
        assert_eq!("REQUEST CONNECT domain internal.example 8443\n", line);
        assert_eq!(dest, parse_request(line.trim_end()).unwrap());
    }

    #[test]
    fn request_rejects_non_connect() {
        assert!(parse_request("REQUEST BIND ipv4 1.2.3.4 80").is_err());
        assert!(parse_request("REQUEST CONNECT ipv4 1.2.3.4 0").is_err());
        assert!(parse_request("REQUEST CONNECT ipv4 1.2.3.4").is_err());
    }

    #[test]
    fn reply_parses_success_failure_and_err() {
        let ok = parse_reply("REPLY 0 ipv4 192.168.1.9 40000").unwrap();
        assert_eq!(0, ok.status);
        assert_eq!(40000, ok.bind.port);

        let refused = parse_reply("REPLY 5 ipv4 0.0.0.0 0").unwrap();
        assert_eq!(status::REFUSED, refused.status);
        assert_eq!(0, refused.bind.port);

        let legacy = parse_reply("ERR dial failed: timeout").unwrap();
        assert_eq!(status::GENERAL, legacy.status);
    }

    #[test]
    fn addr_field_wraps_awkward_hosts() {
        assert_eq!("example.com", encode_addr_field("example.com"));
        let wrapped = encode_addr_field("internal host");
        assert!(wrapped.starts_with("b64:"));
        assert_eq!("internal host", decode_addr_field(&wrapped).unwrap());
        assert_eq!("plain", decode_addr_field("plain").unwrap());
        assert!(decode_addr_field("b64:!!!").is_err());
    }

    #[test]
    fn request_accepts_wrapped_addr_field() {
        let dest = Dest::new(AddrType::Domain, "internal.example", 8443).unwrap();
        let wrapped = "REQUEST CONNECT domain b64:aW50ZXJuYWwuZXhhbXBsZQ== 8443";
        assert_eq!(dest, parse_request(wrapped).unwrap());
    }

    #[test]
    fn dial_errors_map_to_reply_statuses() {
        use std::io::{Error, ErrorKind};
        assert_eq!(5, status_for_dial_error(&Error::from(ErrorKind::ConnectionRefused)));
        assert_eq!(3, status_for_dial_error(&Error::from(ErrorKind::NetworkUnreachable)));
        assert_eq!(4, status_for_dial_error(&Error::from(ErrorKind::HostUnreachable)));
        assert_eq!(4, status_for_dial_error(&Error::from(ErrorKind::TimedOut)));
        assert_eq!(1, status_for_dial_error(&Error::from(ErrorKind::BrokenPipe)));
    }
}
