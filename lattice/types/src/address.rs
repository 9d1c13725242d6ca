// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Locality classification of a bus address, as a bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddressScope(u8);

impl AddressScope {
    pub const NONE: AddressScope = AddressScope(0);
    /// The address is only reachable from the owning process.
    pub const LOCAL_PROCESS: AddressScope = AddressScope(1);
    /// The address is only reachable from the owning host.
    pub const LOCAL_HOST: AddressScope = AddressScope(2);

    pub fn contains(self, other: AddressScope) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AddressScope {
    type Output = AddressScope;

    fn bitor(self, rhs: AddressScope) -> AddressScope {
        AddressScope(self.0 | rhs.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("address {0:?} has no scheme separator")]
    MissingScheme(String),
    #[error("unknown address scheme {0:?}")]
    UnknownScheme(String),
    #[error("invalid {scheme} handle {value:?}")]
    InvalidHandle { scheme: &'static str, value: String },
    #[error("address {0:?} has no port")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

/// A parsed bus address. The concrete transport behind each scheme is out of
/// scope here; addresses are carried through discovery records and handed to
/// whichever connector claims the scheme.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusAddress {
    /// `mem://<hex-handle>`, an in-process channel.
    Memory(u64),
    /// `shm://<hex-handle>`, a same-host shared-memory segment.
    SharedMemory(u64),
    /// `unix://<path>`, a same-host domain socket.
    Unix(String),
    /// `ipv4://host:port`
    Ipv4 { host: String, port: u16 },
    /// `ipv6://[host]:port`
    Ipv6 { host: String, port: u16 },
    /// `dns://host:port`
    Dns { host: String, port: u16 },
}

impl BusAddress {
    pub fn scheme(&self) -> &'static str {
        match self {
            BusAddress::Memory(_) => "mem",
            BusAddress::SharedMemory(_) => "shm",
            BusAddress::Unix(_) => "unix",
            BusAddress::Ipv4 { .. } => "ipv4",
            BusAddress::Ipv6 { .. } => "ipv6",
            BusAddress::Dns { .. } => "dns",
        }
    }

    pub fn scope(&self) -> AddressScope {
        match self {
            BusAddress::Memory(_) => AddressScope::LOCAL_PROCESS | AddressScope::LOCAL_HOST,
            BusAddress::SharedMemory(_) | BusAddress::Unix(_) => AddressScope::LOCAL_HOST,
            BusAddress::Ipv4 { .. } | BusAddress::Ipv6 { .. } | BusAddress::Dns { .. } => {
                AddressScope::NONE
            }
        }
    }
}

fn parse_hex_handle(scheme: &'static str, value: &str) -> Result<u64, AddressParseError> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(trimmed, 16).map_err(|_| AddressParseError::InvalidHandle {
        scheme,
        value: value.to_string(),
    })
}

fn parse_host_port(input: &str, rest: &str) -> Result<(String, u16), AddressParseError> {
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| AddressParseError::MissingPort(input.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressParseError::InvalidPort(input.to_string()))?;
    Ok((host.to_string(), port))
}

impl FromStr for BusAddress {
    type Err = AddressParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| AddressParseError::MissingScheme(input.to_string()))?;

        match scheme {
            "mem" => Ok(BusAddress::Memory(parse_hex_handle("mem", rest)?)),
            "shm" => Ok(BusAddress::SharedMemory(parse_hex_handle("shm", rest)?)),
            "unix" => Ok(BusAddress::Unix(rest.to_string())),
            "ipv4" => {
                let (host, port) = parse_host_port(input, rest)?;
                Ok(BusAddress::Ipv4 { host, port })
            }
            "ipv6" => {
                let (host, port) = parse_host_port(input, rest)?;
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(&host)
                    .to_string();
                Ok(BusAddress::Ipv6 { host, port })
            }
            "dns" => {
                let (host, port) = parse_host_port(input, rest)?;
                Ok(BusAddress::Dns { host, port })
            }
            other => Err(AddressParseError::UnknownScheme(other.to_string())),
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Memory(handle) => write!(f, "mem://{handle:x}"),
            BusAddress::SharedMemory(handle) => write!(f, "shm://{handle:x}"),
            BusAddress::Unix(path) => write!(f, "unix://{path}"),
            BusAddress::Ipv4 { host, port } => write!(f, "ipv4://{host}:{port}"),
            BusAddress::Ipv6 { host, port } => write!(f, "ipv6://[{host}]:{port}"),
            BusAddress::Dns { host, port } => write!(f, "dns://{host}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        for text in [
            "mem://1f",
            "shm://dead",
            "unix:///tmp/lattice.sock",
            "ipv4://10.0.0.3:9100",
            "ipv6://[::1]:9100",
            "dns://registry.internal:2379",
        ] {
            let parsed: BusAddress = text.parse().unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn scope_classification() {
        let mem: BusAddress = "mem://10".parse().unwrap();
        assert!(mem.scope().contains(AddressScope::LOCAL_PROCESS));
        assert!(mem.scope().contains(AddressScope::LOCAL_HOST));

        let shm: BusAddress = "shm://10".parse().unwrap();
        assert!(!shm.scope().contains(AddressScope::LOCAL_PROCESS));
        assert!(shm.scope().contains(AddressScope::LOCAL_HOST));

        let unix: BusAddress = "unix:///run/a.sock".parse().unwrap();
        assert!(unix.scope().contains(AddressScope::LOCAL_HOST));

        let tcp: BusAddress = "ipv4://127.0.0.1:80".parse().unwrap();
        assert_eq!(tcp.scope(), AddressScope::NONE);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(
            "nope".parse::<BusAddress>(),
            Err(AddressParseError::MissingScheme("nope".to_string()))
        );
        assert_eq!(
            "tcp://host:1".parse::<BusAddress>(),
            Err(AddressParseError::UnknownScheme("tcp".to_string()))
        );
        assert!(matches!(
            "mem://zz".parse::<BusAddress>(),
            Err(AddressParseError::InvalidHandle { scheme: "mem", .. })
        ));
        assert_eq!(
            "ipv4://hostonly".parse::<BusAddress>(),
            Err(AddressParseError::MissingPort("ipv4://hostonly".to_string()))
        );
        assert_eq!(
            "dns://host:70000".parse::<BusAddress>(),
            Err(AddressParseError::InvalidPort("dns://host:70000".to_string()))
        );
    }
}
