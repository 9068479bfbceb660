use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use super::protocol::{DEFAULT_PORT, DEFAULT_TICK_RATE};

pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 27, 15), 27016);

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub port: u16,
    pub multicast_group: SocketAddr,
    pub tick_rate: u32,
    /// Silence after which a peer is dropped.
    pub timeout: Duration,
    pub ping_interval: Duration,
    pub min_resend_delay: Duration,
    pub replication_interval: Duration,
    pub small_radius: f32,
    pub large_radius: f32,
    pub server_name: String,
    pub max_connections: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            multicast_group: SocketAddr::V4(DEFAULT_MULTICAST_GROUP),
            tick_rate: DEFAULT_TICK_RATE,
            timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            min_resend_delay: Duration::from_millis(100),
            replication_interval: Duration::from_millis(50),
            small_radius: 5.0,
            large_radius: 20.0,
            server_name: "Meridian Server".to_string(),
            max_connections: 32,
        }
    }
}
