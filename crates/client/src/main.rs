mod client;
mod config;

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use meridian::NetConfig;

use client::{Exit, GameClient};
use config::{ClientConfig, Target};

#[derive(Parser)]
#[command(name = "meridian-client")]
#[command(about = "Headless Meridian client that wanders around a server")]
struct Args {
    #[arg(
        short,
        long,
        help = "Server address to connect to (e.g., 127.0.0.1:27015)",
        conflicts_with = "discover"
    )]
    server: Option<SocketAddr>,

    #[arg(long, help = "Find a server on the LAN instead")]
    discover: bool,

    #[arg(short, long, help = "Seconds to stay connected")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 2, help = "Seconds between status lines")]
    status_interval: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let net = NetConfig::default();

    let target = match args.server {
        Some(addr) => Target::Address(addr),
        None if args.discover => Target::Discover(net.multicast_group),
        None => Target::Address(SocketAddr::from(([127, 0, 0, 1], net.port))),
    };

    let config = ClientConfig {
        target,
        net,
        duration: args.duration.map(Duration::from_secs),
        status_interval: Duration::from_secs(args.status_interval.max(1)),
        wander_period: Duration::from_secs(2),
    };

    let mut client = GameClient::new(config)?;
    match client.run() {
        Exit::Finished => log::info!("done"),
        Exit::Disconnected(reason) => anyhow::bail!("disconnected: {reason}"),
    }
    Ok(())
}
