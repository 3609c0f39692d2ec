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

//! Destination triples
//!
//! A destination is what travels over the control plane: an address type,
//! the address text, and a port. Numeric addresses are stored canonicalized
//! so equality checks (the direct-mode mismatch guard) are textual.

use core::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    /// Dotted-quad IPv4.
    Ipv4,
    /// Colon-hex IPv6.
    Ipv6,
    /// DNS name, resolved by the dialling side.
    Domain,
}

impl AddrType {
    /// Wire name of this address type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AddrType::Ipv4 => "ipv4",
            AddrType::Ipv6 => "ipv6",
            AddrType::Domain => "domain",
        }
    }

    /// Parses a wire name.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "ipv4" => Some(AddrType::Ipv4),
            "ipv6" => Some(AddrType::Ipv6),
            "domain" => Some(AddrType::Domain),
            _ => None,
        }
    }
}

/// Reasons a destination triple is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DestError {
    /// Address text does not parse for the claimed family.
    #[error("address does not parse as {0}")]
    BadAddress(&'static str),
    /// Domain name is empty or longer than 255 bytes.
    #[error("domain length out of range")]
    DomainLength,
    /// Port 0 is not a dialable destination.
    #[error("port must be in 1..65535")]
    BadPort,
}

/// A validated destination triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dest {
    /// Address family.
    pub atype: AddrType,
    /// Address text; canonical for numeric families, opaque for domains.
    pub addr: String,
    /// Destination port.
    pub port: u16,
}

impl Dest {
    /// Validates and canonicalizes a destination triple.
    pub fn new(atype: AddrType, addr: &str, port: u16) -> Result<Self, DestError> {
        if port == 0 {
            return Err(DestError::BadPort);
        }
        let addr = match atype {
            AddrType::Ipv4 => addr
                .parse::<Ipv4Addr>()
                .map_err(|_| DestError::BadAddress("ipv4"))?
                .to_string(),
            AddrType::Ipv6 => addr
                .parse::<Ipv6Addr>()
                .map_err(|_| DestError::BadAddress("ipv6"))?
                .to_string(),
            AddrType::Domain => {
                if addr.is_empty() || addr.len() > 255 {
                    return Err(DestError::DomainLength);
                }
                addr.to_owned()
            }
        };
        Ok(Self { atype, addr, port })
    }

    /// Infers the address family from the host text.
    ///
    /// Used where only a host string is available, e.g. the pool's
    /// `--target-host` flag.
    pub fn from_host_port(host: &str, port: u16) -> Result<Self, DestError> {
        let atype = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => AddrType::Ipv4,
            Ok(IpAddr::V6(_)) => AddrType::Ipv6,
            Err(_) => AddrType::Domain,
        };
        Self::new(atype, host, port)
    }

    /// Destination for a concrete socket address, e.g. a REPLY bind field.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let atype = match addr.ip() {
            IpAddr::V4(_) => AddrType::Ipv4,
            IpAddr::V6(_) => AddrType::Ipv6,
        };
        Self {
            atype,
            addr: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Validates a bind address, which unlike a dial destination may carry
    /// port 0 (the customary `0.0.0.0 0` of non-zero replies).
    pub fn new_bind(atype: AddrType, addr: &str, port: u16) -> Result<Self, DestError> {
        if port == 0 {
            let mut dest = Self::new(atype, addr, 1)?;
            dest.port = 0;
            return Ok(dest);
        }
        Self::new(atype, addr, port)
    }

    /// The all-zero IPv4 bind used in failure replies.
    pub fn unspecified() -> Self {
        Self {
            atype: AddrType::Ipv4,
            addr: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 0,
        }
    }
}

impl Display for Dest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.atype {
            AddrType::Ipv6 => write!(f, "[{}]:{}", self.addr, self.port),
            _ => write!(f, "{}:{}", self.addr, self.port),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{AddrType, Dest, DestError};

    #[test]
    fn ipv4_canonicalizes() {
        let d = Dest::new(AddrType::Ipv4, "010.0.0.1", 80);
        // Leading zeros are not valid dotted-quad text.
        assert_eq!(Err(DestError::BadAddress("ipv4")), d);
        let d = Dest::new(AddrType::Ipv4, "10.0.0.1", 80).unwrap();
        assert_eq!("10.0.0.1", d.addr);
    }

    #[test]
    fn ipv6_canonicalizes() {
        let d = Dest::new(AddrType::Ipv6, "0:0:0:0:0:0:0:1", 443).unwrap();
        assert_eq!("::1", d.addr);
    }

    #[test]
    fn domain_length_bounds() {
        assert_eq!(
            Err(DestError::DomainLength),
            Dest::new(AddrType::Domain, "", 80)
        );
        let long = "a".repeat(256);
        assert_eq!(
            Err(DestError::DomainLength),
            Dest::new(AddrType::Domain, &long, 80)
        );
        assert!(Dest::new(AddrType::Domain, &"a".repeat(255), 80).is_ok());
    }

    #[test]
    fn port_zero_rejected() {
        assert_eq!(
            Err(DestError::BadPort),
            Dest::new(AddrType::Domain, "example.com", 0)
        );
    }

    #[test]
    fn from_host_port_infers_family() {
        assert_eq!(
            AddrType::Ipv4,
            Dest::from_host_port("127.0.0.1", 1).unwrap().atype
        );
        assert_eq!(AddrType::Ipv6, Dest::from_host_port("::1", 1).unwrap().atype);
        assert_eq!(
            AddrType::Domain,
            Dest::from_host_port("localhost", 1).unwrap().atype
        );
    }

    #[test]
    fn display_brackets_ipv6() {
        let d = Dest::new(AddrType::Ipv6, "::1", 22).unwrap();
        assert_eq!("[::1]:22", d.to_string());
        let d = Dest::new(AddrType::Domain, "example.com", 80).unwrap();
        assert_eq!("example.com:80", d.to_string());
    }
}
