// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Selection of the local address used when dialing a backend.
//!
//! With address conversion enabled, the client's IPv4 address is embedded in
//! the low 32 bits of a configured IPv6 prefix, so an IPv6-only backend can
//! tell clients apart by looking at its peer address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// An IPv6 address whose low 32 bits are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionPrefix(Ipv6Addr);

impl ConversionPrefix {
    pub fn new(prefix: Ipv6Addr) -> Option<Self> {
        if prefix.octets()[12..] == [0; 4] {
            Some(Self(prefix))
        } else {
            None
        }
    }

    pub fn embed(&self, client: Ipv4Addr) -> Ipv6Addr {
        let mut octets = self.0.octets();
        octets[12..].copy_from_slice(&client.octets());
        Ipv6Addr::from(octets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialSource {
    /// Let the kernel pick the source address.
    Ephemeral,
    Fixed(Ipv6Addr),
    Converted(ConversionPrefix),
}

#[derive(Debug, Error)]
#[error("peer {0} has no IPv4 address to embed")]
pub struct UnconvertiblePeer(pub IpAddr);

impl DialSource {
    /// Source address to bind before connecting on behalf of `peer`.
    pub fn source_for(&self, peer: IpAddr) -> Result<Option<Ipv6Addr>, UnconvertiblePeer> {
        match self {
            DialSource::Ephemeral => Ok(None),
            DialSource::Fixed(address) => Ok(Some(*address)),
            DialSource::Converted(prefix) => {
                let client = match peer {
                    IpAddr::V4(address) => address,
                    IpAddr::V6(address) => address
                        .to_ipv4_mapped()
                        .ok_or(UnconvertiblePeer(peer))?,
                };
                Ok(Some(prefix.embed(client)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> ConversionPrefix {
        ConversionPrefix::new("2001:db8::".parse().unwrap()).unwrap()
    }

    #[test]
    fn embeds_client_in_low_bits() {
        let converted = prefix().embed(Ipv4Addr::new(203, 0, 113, 7));
        let octets = converted.octets();

        assert_eq!(octets[12..], [203, 0, 113, 7]);
        assert_eq!(octets[..12], "2001:db8::".parse::<Ipv6Addr>().unwrap().octets()[..12]);
        assert_eq!(converted, "2001:db8::cb00:7107".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn rejects_prefix_with_low_bits() {
        assert!(ConversionPrefix::new("2001:db8::1".parse().unwrap()).is_none());
        assert!(ConversionPrefix::new("2001:db8::1:0:0".parse().unwrap()).is_some());
    }

    #[test]
    fn source_selection() {
        let peer: IpAddr = "192.0.2.10".parse().unwrap();
        let fixed: Ipv6Addr = "2001:db8::53".parse().unwrap();

        assert_eq!(DialSource::Ephemeral.source_for(peer).unwrap(), None);
        assert_eq!(DialSource::Fixed(fixed).source_for(peer).unwrap(), Some(fixed));
        assert_eq!(
            DialSource::Converted(prefix()).source_for(peer).unwrap(),
            Some("2001:db8::c000:20a".parse().unwrap())
        );
    }

    #[test]
    fn mapped_peer_is_unmapped() {
        let peer: IpAddr = "::ffff:192.0.2.10".parse().unwrap();
        assert_eq!(
            DialSource::Converted(prefix()).source_for(peer).unwrap(),
            Some("2001:db8::c000:20a".parse().unwrap())
        );

        let native: IpAddr = "2001:db8:ffff::1".parse().unwrap();
        assert!(DialSource::Converted(prefix()).source_for(native).is_err());
    }
}
