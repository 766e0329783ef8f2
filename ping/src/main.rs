use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{anyhow, Result};
use clap::Parser;

mod args;
mod icmp;
mod packet;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let opts = args::Opts::parse();

    let dst_addr = resolve(&opts.destination).await?;
    let mut client = icmp::IcmpClient::new(opts, dst_addr)?;
    client.run().await
}

/// Resolve the destination to the first IPv4 address it maps to. Literal
/// addresses pass through untouched.
async fn resolve(destination: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = destination.parse() {
        return Ok(addr);
    }
    let addrs = tokio::net::lookup_host((destination, 0))
        .await
        .map_err(|e| anyhow!("lookup for {} failed: {}", destination, e))?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| anyhow!("no IPv4 address found for {}", destination))
}
