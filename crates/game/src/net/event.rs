use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use super::protocol::ServerInfo;
use crate::ecs::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    /// The peer said goodbye, or refused the connection.
    Remote,
    Local,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timed out",
            Self::Remote => "closed by peer",
            Self::Local => "closed locally",
        })
    }
}

/// Lifecycle notifications for whoever drives the networking system.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected {
        addr: SocketAddr,
        entity: Option<Entity>,
    },
    Disconnected {
        addr: SocketAddr,
        entity: Option<Entity>,
        reason: DisconnectReason,
    },
    ServerDiscovered {
        addr: SocketAddr,
        info: ServerInfo,
    },
    PingMeasured {
        addr: SocketAddr,
        rtt: Duration,
    },
}

/// Connection table changes requested while a packet is being processed.
/// Applied once the packet is done so the table never changes mid-dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetCommand {
    /// Keep the provisional connection the current packet arrived on.
    Accept,
    Disconnect {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
}
