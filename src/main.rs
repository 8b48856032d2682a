// Copyright 2024 Raphael Peters
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the “Software”), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

use anyhow::{Context, Result};
use argh::FromArgs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sni64proxy::{Config, Proxy, SystemResolver};

#[derive(FromArgs)]
/// Proxy IPv4 TLS connections to IPv6 hosts by looking at the SNI header, checking the name against the
/// configured allow and deny rules and looking up the AAAA record of the name.
struct Opts {
    /// path of the YAML configuration file
    #[argh(short = 'c', option, default = "PathBuf::from(\"config.yaml\")")]
    config: PathBuf,

    /// log at debug level, regardless of the configuration
    #[argh(short = 'd', switch)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts: Opts = argh::from_env();
    let config = Config::load(&opts.config)
        .with_context(|| format!("failed loading configuration from {}", opts.config.display()))?;

    let default_level = if opts.debug || config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let listen_address = config.network.listen_address;
    let listener = TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("failed listening on {listen_address}"))?;
    info!(address = %listener.local_addr()?, "listening");

    let proxy = Arc::new(Proxy::new(config, Arc::new(SystemResolver)));
    proxy.serve(listener).await;

    Ok(())
}
