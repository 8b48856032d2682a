// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Per-connection routing: sniff, check policy, resolve, dial, relay.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{copy, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tokio::{select, spawn};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, Timeouts};
use crate::policy::{Allowance, Policy};
use crate::resolve::Resolver;
use crate::sni::{sniff, SniError, Sniffed};
use crate::source::{DialSource, UnconvertiblePeer};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no usable server name")]
    Sniff(#[from] SniError),
    #[error("no ClientHello within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("{hostname} is not allowed")]
    NotAllowed { hostname: String },
    #[error("failed resolving {hostname}")]
    Resolve {
        hostname: String,
        #[source]
        source: io::Error,
    },
    #[error("destination {0} is denied")]
    Denied(Ipv6Addr),
    #[error(transparent)]
    Source(#[from] UnconvertiblePeer),
    #[error("failed connecting to {destination}")]
    Connect {
        destination: SocketAddrV6,
        #[source]
        source: io::Error,
    },
    #[error("connecting to {0} timed out")]
    ConnectTimeout(SocketAddrV6),
    #[error("failed replaying ClientHello to the backend")]
    Replay(#[source] io::Error),
}

/// Identity of one accepted connection, attached to every event it logs.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionContext {
    pub id: Uuid,
    pub peer: SocketAddr,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::now_v7(),
            peer,
        }
    }
}

pub struct Proxy {
    policy: Policy,
    resolver: Arc<dyn Resolver>,
    remote_port: u16,
    dial_source: DialSource,
    handshake_buffer: usize,
    timeouts: Timeouts,
}

impl Proxy {
    pub fn new(config: Config, resolver: Arc<dyn Resolver>) -> Self {
        let Config {
            network,
            handshake_buffer,
            timeouts,
            allow_rule,
            deny_rule,
            ..
        } = config;

        Self {
            policy: Policy::new(allow_rule, deny_rule, Arc::clone(&resolver)),
            resolver,
            remote_port: network.remote_port,
            dial_source: network.dial_source,
            handshake_buffer,
            timeouts,
        }
    }

    /// Accepts connections forever, handling each one on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((client, peer)) => {
                    let proxy = Arc::clone(&self);
                    spawn(async move { proxy.handle(client, peer).await });
                }
                Err(error) => {
                    // usually fd exhaustion, give other connections a moment to close
                    warn!(%error, "failed accepting connection");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handles one client connection to completion. Errors only end this
    /// connection; the client sees nothing but a closed socket.
    pub async fn handle(&self, client: TcpStream, peer: SocketAddr) {
        let ctx = ConnectionContext::new(peer);
        debug!(conn_id = %ctx.id, from = %peer, "accepted connection");

        let error = match self.route(&ctx, client).await {
            Ok(()) => {
                debug!(conn_id = %ctx.id, "connection closed");
                return;
            }
            Err(error) => error,
        };

        let quiet = matches!(
            error,
            RouteError::Sniff(_) | RouteError::HandshakeTimeout(_) | RouteError::Replay(_)
        );
        let error = anyhow::Error::from(error);
        if quiet {
            debug!(conn_id = %ctx.id, error = %format!("{error:#}"), "dropping connection");
        } else {
            warn!(conn_id = %ctx.id, error = %format!("{error:#}"), "dropping connection");
        }
    }

    async fn route(&self, ctx: &ConnectionContext, mut client: TcpStream) -> Result<(), RouteError> {
        let Sniffed {
            server_name,
            consumed,
        } = self.sniff(&mut client).await?;
        let hostname = server_name?;
        debug!(conn_id = %ctx.id, %hostname, "server name found");

        match self.policy.check_allowed(&hostname).await {
            Allowance::Whitelisted => debug!(conn_id = %ctx.id, %hostname, "whitelisted"),
            Allowance::InPrefix(address) => {
                debug!(conn_id = %ctx.id, %hostname, %address, "resolved into allowed prefix")
            }
            Allowance::OutsidePrefixes(addresses) => {
                debug!(conn_id = %ctx.id, %hostname, ?addresses, "no address in allowed prefixes");
                return Err(RouteError::NotAllowed { hostname });
            }
            Allowance::LookupFailed(error) => {
                debug!(conn_id = %ctx.id, %hostname, %error, "failed looking up IPv4 addresses");
                return Err(RouteError::NotAllowed { hostname });
            }
        }

        let resolved = self.resolve_destination(&hostname).await?;
        if self.policy.is_denied(resolved.ip()) {
            return Err(RouteError::Denied(*resolved.ip()));
        }
        let destination = backend_address(resolved, self.remote_port);
        let source = self.dial_source.source_for(ctx.peer.ip())?;

        debug!(conn_id = %ctx.id, %destination, ?source, "dialing backend");
        let mut backend = self.dial(source, destination).await?;

        info!(
            conn_id = %ctx.id,
            %hostname,
            from = %ctx.peer,
            via = ?backend.local_addr().ok(),
            to = %destination,
            "connection established"
        );

        backend
            .write_all(&consumed)
            .await
            .map_err(RouteError::Replay)?;

        relay(ctx, client, backend).await;
        Ok(())
    }

    async fn sniff(&self, client: &mut TcpStream) -> Result<Sniffed, RouteError> {
        let sniffing = sniff(client, self.handshake_buffer);
        match self.timeouts.handshake {
            Some(limit) => timeout(limit, sniffing)
                .await
                .map_err(|_| RouteError::HandshakeTimeout(limit)),
            None => Ok(sniffing.await),
        }
    }

    async fn resolve_destination(&self, hostname: &str) -> Result<SocketAddrV6, RouteError> {
        let resolve_error = |source| RouteError::Resolve {
            hostname: hostname.to_owned(),
            source,
        };
        self.resolver
            .lookup_ipv6(hostname)
            .await
            .map_err(resolve_error)?
            .first()
            .copied()
            .ok_or_else(|| resolve_error(io::ErrorKind::NotFound.into()))
    }

    async fn dial(
        &self,
        source: Option<Ipv6Addr>,
        destination: SocketAddrV6,
    ) -> Result<TcpStream, RouteError> {
        let connecting = async {
            let socket = TcpSocket::new_v6()?;
            if let Some(source) = source {
                socket.bind(SocketAddrV6::new(source, 0, 0, 0).into())?;
            }
            socket.connect(destination.into()).await
        };

        let connected = match self.timeouts.connect {
            Some(limit) => timeout(limit, connecting)
                .await
                .map_err(|_| RouteError::ConnectTimeout(destination))?,
            None => connecting.await,
        };
        connected.map_err(|source| RouteError::Connect {
            destination,
            source,
        })
    }
}

/// Puts the backend port on a resolved address. The scope id stays, a
/// link-local destination is unreachable without it.
fn backend_address(resolved: SocketAddrV6, port: u16) -> SocketAddrV6 {
    SocketAddrV6::new(*resolved.ip(), port, 0, resolved.scope_id())
}

/// Copies in both directions until either side finishes, then drops both
/// sockets so the other direction ends too.
async fn relay(ctx: &ConnectionContext, mut client: TcpStream, mut backend: TcpStream) {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    select! {
        result = copy(&mut client_read, &mut backend_write) => match result {
            Ok(bytes) => debug!(conn_id = %ctx.id, bytes, "client closed"),
            Err(error) => debug!(conn_id = %ctx.id, %error, "failed transferring data from client to backend"),
        },
        result = copy(&mut backend_read, &mut client_write) => match result {
            Ok(bytes) => debug!(conn_id = %ctx.id, bytes, "backend closed"),
            Err(error) => debug!(conn_id = %ctx.id, %error, "failed transferring data from backend to client"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_address_keeps_scope() {
        let resolved = SocketAddrV6::new("fe80::1".parse().unwrap(), 0, 0, 7);
        let destination = backend_address(resolved, 8443);

        assert_eq!(destination.ip(), resolved.ip());
        assert_eq!(destination.port(), 8443);
        assert_eq!(destination.scope_id(), 7);
        assert_eq!(destination.to_string(), "[fe80::1%7]:8443");
    }
}
