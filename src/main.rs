use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use udptunneld::server::{IpFamily, Server};

/// Server end of a TCP-over-UDP tunnel. Listens for tunnel frames on one
/// UDP port and opens a TCP connection per HELLO it accepts.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct ServerOptions {
    /// Listen on IPv6 instead of IPv4
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,

    /// `[host] port`; with only a port, binds the wildcard address
    #[arg(value_name = "[HOST] PORT", required = true, num_args = 1..=2)]
    listen: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = ServerOptions::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let family = if opts.ipv6 { IpFamily::V6 } else { IpFamily::V4 };

    let (host, port) = match opts.listen.as_slice() {
        [port] => (None, port.as_str()),
        [host, port] => (Some(host.as_str()), port.as_str()),
        _ => bail!("usage: udptunneld [-6] [host] port"),
    };
    let port: u16 = port.parse().with_context(|| format!("invalid port {port:?}"))?;

    let server = Server::bind(host, port, family)
        .await
        .with_context(|| format!("failed to bind udp listener on port {port}"))?;

    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server loop failed")?;
    Ok(())
}
