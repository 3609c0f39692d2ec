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

//! SOCKS5 front end
//!
//! The no-auth CONNECT subset of IETF RFC 1928, parsed incrementally: each
//! function inspects a buffered prefix and advances only when the next
//! structural segment is fully present, so it can be re-run as bytes
//! trickle in. Extracted destinations are handed to the control plane
//! verbatim; the dial happens on the far side of the tunnel.

use crate::dest::{AddrType, Dest};
use crate::proto::status;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Result of feeding buffered bytes to the greeting parser.
#[derive(Debug, PartialEq, Eq)]
pub enum GreetingOutcome {
    /// The greeting is not fully buffered yet.
    Incomplete,
    /// Valid greeting offering no-auth; `consumed` bytes may be dropped.
    Accept {
        /// Length of the greeting in bytes.
        consumed: usize,
    },
    /// Wrong version or no acceptable method; answer `{05, FF}` and close.
    Reject,
}

/// Result of feeding buffered bytes to the request parser.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The request is not fully buffered yet.
    Incomplete,
    /// A valid CONNECT; `consumed` bytes may be dropped.
    Connect {
        /// Length of the request in bytes.
        consumed: usize,
        /// The requested destination, to be relayed over the control plane.
        dest: Dest,
    },
    /// Malformed or unsupported request; reply with `status` and close.
    Fail {
        /// SOCKS5 reply status to emit.
        status: u8,
    },
}

/// Parses the client greeting `{05, N, methods[N]}`.
pub fn parse_greeting(buf: &[u8]) -> GreetingOutcome {
    if buf.len() < 2 {
        return GreetingOutcome::Incomplete;
    }
    if buf[0] != VERSION || buf[1] == 0 {
        return GreetingOutcome::Reject;
    }
    let n_methods = buf[1] as usize;
    if buf.len() < 2 + n_methods {
        return GreetingOutcome::Incomplete;
    }
    if buf[2..2 + n_methods].contains(&METHOD_NO_AUTH) {
        GreetingOutcome::Accept {
            consumed: 2 + n_methods,
        }
    } else {
        GreetingOutcome::Reject
    }
}

/// Parses the client request `{05, CMD, 00, ATYP, DST.ADDR, DST.PORT}`.
pub fn parse_request(buf: &[u8]) -> RequestOutcome {
    if buf.len() < 4 {
        return RequestOutcome::Incomplete;
    }
    if buf[0] != VERSION || buf[2] != 0x00 {
        return RequestOutcome::Fail {
            status: status::GENERAL,
        };
    }
    if buf[1] != CMD_CONNECT {
        return RequestOutcome::Fail {
            status: status::CMD_UNSUPPORTED,
        };
    }

    let (atype, addr, addr_end) = match buf[3] {
        ATYP_IPV4 => {
            if buf.len() < 10 {
                return RequestOutcome::Incomplete;
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            (
                AddrType::Ipv4,
                std::net::Ipv4Addr::from(octets).to_string(),
                8,
            )
        }
        ATYP_IPV6 => {
            if buf.len() < 22 {
                return RequestOutcome::Incomplete;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            (
                AddrType::Ipv6,
                std::net::Ipv6Addr::from(octets).to_string(),
                20,
            )
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return RequestOutcome::Incomplete;
            }
            let name_len = buf[4] as usize;
            if name_len == 0 {
                // Zero-length names are treated as invalid addresses, not
                // as an unsupported address type.
                return RequestOutcome::Fail {
                    status: status::GENERAL,
                };
            }
            if buf.len() < 5 + name_len + 2 {
                return RequestOutcome::Incomplete;
            }
            let name = match std::str::from_utf8(&buf[5..5 + name_len]) {
                Ok(name) => name.to_owned(),
                Err(_) => {
                    return RequestOutcome::Fail {
                        status: status::GENERAL,
                    }
                }
            };
            (AddrType::Domain, name, 5 + name_len)
        }
        _ => {
            return RequestOutcome::Fail {
                status: status::ATYPE_UNSUPPORTED,
            }
        }
    };

    let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);
    match Dest::new(atype, &addr, port) {
        Ok(dest) => RequestOutcome::Connect {
            consumed: addr_end + 2,
            dest,
        },
        Err(_) => RequestOutcome::Fail {
            status: status::GENERAL,
        },
    }
}

/// The `{05, 00}` method-selection reply.
pub const fn method_selection() -> [u8; 2] {
    [VERSION, METHOD_NO_AUTH]
}

/// The `{05, FF}` no-acceptable-methods reply.
pub const fn no_acceptable_methods() -> [u8; 2] {
    [VERSION, 0xFF]
}

/// A success reply carrying the bind address the worker reported.
pub fn success_reply(bind: &Dest) -> Vec<u8> {
    let mut reply = vec![VERSION, status::SUCCESS, 0x00];
    match bind.atype {
        AddrType::Ipv4 => {
            reply.push(ATYP_IPV4);
            match bind.addr.parse::<std::net::Ipv4Addr>() {
                Ok(ip) => reply.extend_from_slice(&ip.octets()),
                Err(_) => reply.extend_from_slice(&[0, 0, 0, 0]),
            }
        }
        AddrType::Ipv6 => {
            reply.push(ATYP_IPV6);
            match bind.addr.parse::<std::net::Ipv6Addr>() {
                Ok(ip) => reply.extend_from_slice(&ip.octets()),
                Err(_) => reply.extend_from_slice(&[0u8; 16]),
            }
        }
        AddrType::Domain => {
            reply.push(ATYP_DOMAIN);
            reply.push(bind.addr.len() as u8);
            reply.extend_from_slice(bind.addr.as_bytes());
        }
    }
    reply.extend_from_slice(&bind.port.to_be_bytes());
    reply
}

/// A failure reply `{05, status, 00, 01, 0.0.0.0, 0}`.
pub fn failure_reply(reply_status: u8) -> [u8; 10] {
    [
        VERSION,
        clamp_reply_status(reply_status),
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Maps an arbitrary control-plane REPLY status into the SOCKS5 reply
/// range: 0 passes through, anything outside 1..=8 becomes general failure.
pub fn clamp_reply_status(reply_status: u8) -> u8 {
    match reply_status {
        0..=8 => reply_status,
        _ => status::GENERAL,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn greeting_waits_for_all_methods() {
        assert_eq!(GreetingOutcome::Incomplete, parse_greeting(&[]));
        assert_eq!(GreetingOutcome::Incomplete, parse_greeting(&[0x05]));
        assert_eq!(GreetingOutcome::Incomplete, parse_greeting(&[0x05, 0x02, 0x00]));
        assert_eq!(
            GreetingOutcome::Accept { consumed: 4 },
            parse_greeting(&[0x05, 0x02, 0x01, 0x00])
        );
    }

    #[test]
    fn greeting_rejects_bad_version_and_missing_no_auth() {
        assert_eq!(GreetingOutcome::Reject, parse_greeting(&[0x04, 0x01, 0x00]));
        assert_eq!(GreetingOutcome::Reject, parse_greeting(&[0x05, 0x00]));
        assert_eq!(GreetingOutcome::Reject, parse_greeting(&[0x05, 0x01, 0x02]));
    }

    #[test]
    fn request_parses_ipv4_connect() {
        let buf = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];
        match parse_request(&buf) {
            RequestOutcome::Connect { consumed, dest } => {
                assert_eq!(10, consumed);
                assert_eq!(AddrType::Ipv4, dest.atype);
                assert_eq!("127.0.0.1", dest.addr);
                assert_eq!(8080, dest.port);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn request_parses_domain_connect_incrementally() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 0x09];
        buf.extend_from_slice(b"localhost");
        assert_eq!(RequestOutcome::Incomplete, parse_request(&buf));
        buf.extend_from_slice(&6300u16.to_be_bytes());
        match parse_request(&buf) {
            RequestOutcome::Connect { consumed, dest } => {
                assert_eq!(buf.len(), consumed);
                assert_eq!(AddrType::Domain, dest.atype);
                assert_eq!("localhost", dest.addr);
                assert_eq!(6300, dest.port);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn request_parses_ipv6_connect() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x04];
        buf.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
        buf.extend_from_slice(&443u16.to_be_bytes());
        match parse_request(&buf) {
            RequestOutcome::Connect { dest, .. } => {
                assert_eq!(AddrType::Ipv6, dest.atype);
                assert_eq!("::1", dest.addr);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn request_fails_unsupported_command_and_atyp() {
        let bind_cmd = [0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 80];
        assert_eq!(
            RequestOutcome::Fail { status: 7 },
            parse_request(&bind_cmd)
        );
        let bad_atyp = [0x05, 0x01, 0x00, 0x06, 0, 0, 0, 0, 0, 80];
        assert_eq!(RequestOutcome::Fail { status: 8 }, parse_request(&bad_atyp));
    }

    #[test]
    fn request_fails_zero_length_domain_and_zero_port() {
        let empty_domain = [0x05, 0x01, 0x00, 0x03, 0x00, 0x1F, 0x90];
        assert_eq!(
            RequestOutcome::Fail { status: 1 },
            parse_request(&empty_domain)
        );
        let zero_port = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 0];
        assert_eq!(RequestOutcome::Fail { status: 1 }, parse_request(&zero_port));
    }

    #[test]
    fn success_reply_carries_worker_bind() {
        let bind = Dest::new(AddrType::Ipv4, "192.168.1.9", 40000).unwrap();
        let reply = success_reply(&bind);
        assert_eq!(
            vec![0x05, 0x00, 0x00, 0x01, 192, 168, 1, 9, 0x9C, 0x40],
            reply
        );
    }

    #[test]
    fn failure_reply_is_well_formed() {
        assert_eq!(
            [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0],
            failure_reply(5)
        );
        // Out-of-range statuses collapse to general failure.
        assert_eq!(0x01, failure_reply(42)[1]);
    }
}
