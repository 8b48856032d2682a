// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Hostname resolution, split by address family.
//!
//! Policy looks at a hostname's IPv4 addresses while the backend is always
//! dialed over IPv6, so the two lookups are kept apart.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV6};

use async_trait::async_trait;
use tokio::net::lookup_host;

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>>;

    /// IPv6 addresses of `host`, with port 0 and the scope id of link-local
    /// answers kept.
    ///
    /// Fails with [`io::ErrorKind::NotFound`] when `host` has no IPv6 address.
    async fn lookup_ipv6(&self, host: &str) -> io::Result<Vec<SocketAddrV6>>;
}

fn no_ipv6(host: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{host} does not have an IPv6 address"),
    )
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl SystemResolver {
    async fn lookup(host: &str) -> io::Result<Vec<SocketAddr>> {
        Ok(lookup_host((host, 0)).await?.collect())
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>> {
        Ok(Self::lookup(host)
            .await?
            .into_iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(addr) => Some(*addr.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }

    async fn lookup_ipv6(&self, host: &str) -> io::Result<Vec<SocketAddrV6>> {
        let addrs: Vec<_> = Self::lookup(host)
            .await?
            .into_iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(_) => None,
                SocketAddr::V6(addr) => Some(addr),
            })
            .collect();
        if addrs.is_empty() {
            return Err(no_ipv6(host));
        }
        Ok(addrs)
    }
}

/// Fixed host table. Unknown names fail with [`io::ErrorKind::NotFound`],
/// like an NXDOMAIN answer.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn with(self, host: &str, ip: impl Into<IpAddr>) -> Self {
        self.with_addr(host, SocketAddr::new(ip.into(), 0))
    }

    /// Adds an address with its scope id, for link-local answers.
    pub fn with_addr(mut self, host: &str, addr: impl Into<SocketAddr>) -> Self {
        self.hosts.entry(host.to_owned()).or_default().push(addr.into());
        self
    }

    fn get(&self, host: &str) -> io::Result<&[SocketAddr]> {
        self.hosts
            .get(host)
            .map(Vec::as_slice)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup_ipv4(&self, host: &str) -> io::Result<Vec<Ipv4Addr>> {
        Ok(self
            .get(host)?
            .iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(addr) => Some(*addr.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }

    async fn lookup_ipv6(&self, host: &str) -> io::Result<Vec<SocketAddrV6>> {
        let addrs: Vec<_> = self
            .get(host)?
            .iter()
            .filter_map(|addr| match addr {
                SocketAddr::V4(_) => None,
                SocketAddr::V6(addr) => Some(*addr),
            })
            .collect();
        if addrs.is_empty() {
            return Err(no_ipv6(host));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[tokio::test]
    async fn system_resolver_splits_families() {
        let resolver = SystemResolver;

        assert_eq!(
            resolver.lookup_ipv4("127.0.0.1").await.unwrap(),
            vec![Ipv4Addr::LOCALHOST]
        );
        assert!(resolver.lookup_ipv4("::1").await.unwrap().is_empty());

        assert_eq!(
            resolver.lookup_ipv6("::1").await.unwrap(),
            vec![SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0)]
        );
        let error = resolver.lookup_ipv6("127.0.0.1").await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn static_resolver_table() {
        let link_local = SocketAddrV6::new("fe80::1".parse().unwrap(), 0, 0, 3);
        let resolver = StaticResolver::default()
            .with("dual.test", Ipv4Addr::new(192, 0, 2, 1))
            .with("dual.test", Ipv6Addr::LOCALHOST)
            .with("v4only.test", Ipv4Addr::new(192, 0, 2, 2))
            .with_addr("scoped.test", link_local);

        assert_eq!(
            resolver.lookup_ipv4("dual.test").await.unwrap(),
            vec![Ipv4Addr::new(192, 0, 2, 1)]
        );
        assert_eq!(
            resolver.lookup_ipv6("dual.test").await.unwrap(),
            vec![SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0)]
        );
        assert_eq!(
            resolver.lookup_ipv6("scoped.test").await.unwrap()[0].scope_id(),
            3
        );
        assert_eq!(
            resolver.lookup_ipv6("v4only.test").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            resolver.lookup_ipv4("missing.test").await.unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}
