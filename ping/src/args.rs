use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Opts {
    /// Destination host name or IPv4 address
    pub destination: String,
    /// Stop after receiving count reply packets
    #[arg(long, short)]
    pub count: Option<u64>,
    /// Set the SO_DEBUG option on the socket being used
    #[arg(long, short)]
    pub debug: bool,
    /// Wait interval seconds between sending each packet
    #[arg(long, short, default_value = "1")]
    pub interval: u64,
    /// Exit successfully after receiving one reply packet
    #[arg(long, short)]
    pub oneshot: bool,
    /// Number of data bytes to be sent
    #[arg(long, short, default_value = "56")]
    pub size: usize,
    /// Seconds before exiting regardless of how many packets have been
    /// received
    #[arg(long, short)]
    pub timeout: Option<u64>,
    /// Interface to bind to
    #[arg(long, short = 'I')]
    pub iface: Option<String>,
}
