use std::net::SocketAddr;
use std::time::Duration;

use meridian::NetConfig;

/// Where the client finds its server.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Address(SocketAddr),
    /// Probe the LAN and join the first server that answers.
    Discover(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target: Target,
    pub net: NetConfig,
    /// Stop after this long. Runs until disconnected otherwise.
    pub duration: Option<Duration>,
    pub status_interval: Duration,
    /// How long the client holds one heading before picking another.
    pub wander_period: Duration,
}
