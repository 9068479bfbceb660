use std::net::{IpAddr, Ipv4Addr};

use meridian::NetConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub net: NetConfig,
    /// Wandering entities spawned at startup so clients have something to see.
    pub npc_count: usize,
    pub npc_orbit: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            net: NetConfig::default(),
            npc_count: 8,
            npc_orbit: 12.0,
        }
    }
}
