// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! YAML configuration, decoded once at startup into an immutable [`Config`].

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cidr::errors::NetworkParseError;
use cidr::{Ipv4Cidr, Ipv4Inet, Ipv6Cidr, Ipv6Inet};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::policy::{AllowRule, DenyRule, DomainWhitelist};
use crate::source::{ConversionPrefix, DialSource};

/// Handshake buffer used when the configuration does not name one.
pub const DEFAULT_HANDSHAKE_BUFFER: usize = 16384;

/// Smallest usable handshake buffer: one TLS record header.
pub const MIN_HANDSHAKE_BUFFER: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("listen address {value:?} does not name an IPv4 socket address")]
    ListenAddress {
        value: String,
        #[source]
        source: io::Error,
    },
    #[error("remote port must not be 0")]
    RemotePort,
    #[error("dial source address {0:?} must be an IPv6 address")]
    DialSourceAddress(String),
    #[error("address conversion requires a dial source address")]
    ConversionWithoutSource,
    #[error("address conversion requires the last 32 bits of {0} to be zero")]
    ConversionPrefixNotAligned(Ipv6Addr),
    #[error("handshake buffer of {0} bytes is smaller than a TLS record header")]
    HandshakeBuffer(usize),
    #[error("invalid prefix {value:?}")]
    Prefix {
        value: String,
        #[source]
        source: NetworkParseError,
    },
    #[error("failed compiling regex {pattern:?}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug)]
pub struct Config {
    pub network: Network,
    pub handshake_buffer: usize,
    pub debug: bool,
    pub timeouts: Timeouts,
    pub allow_rule: AllowRule,
    pub deny_rule: DenyRule,
}

#[derive(Debug, Clone, Copy)]
pub struct Network {
    pub listen_address: SocketAddrV4,
    pub remote_port: u16,
    pub dial_source: DialSource,
}

/// Optional deadlines. `None` waits for as long as the peer keeps the socket open.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub handshake: Option<Duration>,
    pub connect: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    network: RawNetwork,
    #[serde(default = "default_handshake_buffer")]
    handshake_buffer: usize,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    allow_rule: RawAllowRule,
    #[serde(default)]
    deny_rule: RawDenyRule,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    listen_address: String,
    remote_port: u16,
    #[serde(default)]
    dial_source_address: Option<String>,
    #[serde(default)]
    use_address_conversion: bool,
}

/// Seconds.
#[derive(Debug, Default, Deserialize)]
struct RawTimeouts {
    handshake: Option<u64>,
    connect: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAllowRule {
    #[serde(default)]
    ipv4_addr: Vec<String>,
    #[serde(default)]
    domain: RawDomainWhitelist,
}

#[derive(Debug, Default, Deserialize)]
struct RawDomainWhitelist {
    #[serde(default)]
    plain: HashSet<String>,
    #[serde(default)]
    regex: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDenyRule {
    #[serde(default)]
    ipv6_addr: Vec<String>,
}

fn default_handshake_buffer() -> usize {
    DEFAULT_HANDSHAKE_BUFFER
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(contents)?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.handshake_buffer < MIN_HANDSHAKE_BUFFER {
            return Err(ConfigError::HandshakeBuffer(raw.handshake_buffer));
        }

        let regex = raw
            .allow_rule
            .domain
            .regex
            .into_iter()
            .map(|pattern| match Regex::new(&pattern) {
                Ok(regex) => Ok(regex),
                Err(source) => Err(ConfigError::Regex { pattern, source }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ipv4_addr = raw
            .allow_rule
            .ipv4_addr
            .iter()
            .map(|value| parse_prefix::<Ipv4Inet>(value).map(|inet| inet.network()))
            .collect::<Result<Vec<Ipv4Cidr>, _>>()?;

        let ipv6_addr = raw
            .deny_rule
            .ipv6_addr
            .iter()
            .map(|value| parse_prefix::<Ipv6Inet>(value).map(|inet| inet.network()))
            .collect::<Result<Vec<Ipv6Cidr>, _>>()?;

        Ok(Config {
            network: raw.network.try_into()?,
            handshake_buffer: raw.handshake_buffer,
            debug: raw.debug,
            timeouts: Timeouts {
                handshake: raw.timeouts.handshake.map(Duration::from_secs),
                connect: raw.timeouts.connect.map(Duration::from_secs),
            },
            allow_rule: AllowRule {
                ipv4_addr,
                domain: DomainWhitelist::new(raw.allow_rule.domain.plain, regex),
            },
            deny_rule: DenyRule { ipv6_addr },
        })
    }
}

/// Accepts `ip:port`, `host:port` (resolved once, first IPv4 answer wins)
/// and `:port` for all interfaces.
fn parse_listen_address(value: &str) -> Result<SocketAddrV4, ConfigError> {
    let error = |source| ConfigError::ListenAddress {
        value: value.to_owned(),
        source,
    };

    let address = match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => value.to_owned(),
    };
    address
        .to_socket_addrs()
        .map_err(error)?
        .find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| error(io::Error::new(io::ErrorKind::NotFound, "no IPv4 address")))
}

impl TryFrom<RawNetwork> for Network {
    type Error = ConfigError;

    fn try_from(raw: RawNetwork) -> Result<Self, ConfigError> {
        let listen_address = parse_listen_address(&raw.listen_address)?;

        if raw.remote_port == 0 {
            return Err(ConfigError::RemotePort);
        }

        let dial_source_address = match raw.dial_source_address.as_deref() {
            None | Some("") => None,
            Some(value) => match value.parse::<IpAddr>() {
                Ok(IpAddr::V6(address)) => Some(address),
                _ => return Err(ConfigError::DialSourceAddress(value.to_owned())),
            },
        };

        let dial_source = match (raw.use_address_conversion, dial_source_address) {
            (true, None) => return Err(ConfigError::ConversionWithoutSource),
            (true, Some(prefix)) => DialSource::Converted(
                ConversionPrefix::new(prefix)
                    .ok_or(ConfigError::ConversionPrefixNotAligned(prefix))?,
            ),
            (false, Some(address)) => DialSource::Fixed(address),
            (false, None) => DialSource::Ephemeral,
        };

        Ok(Network {
            listen_address,
            remote_port: raw.remote_port,
            dial_source,
        })
    }
}

fn parse_prefix<T>(value: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = NetworkParseError>,
{
    value.parse().map_err(|source| ConfigError::Prefix {
        value: value.to_owned(),
        source,
    })
}
