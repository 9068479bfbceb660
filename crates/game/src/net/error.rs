use std::io;
use std::net::SocketAddr;

use super::protocol::MessageType;
use super::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to join multicast group {group}: {source}")]
    Multicast {
        group: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Reasons a message could not be queued. None of them are fatal; the caller
/// retries on a later tick or rolls back whatever it was about to record.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no room for {ty}: needs {needed} bytes, {available} available")]
    Full {
        ty: MessageType,
        needed: usize,
        available: usize,
    },
    #[error("{ty} has too many messages in flight")]
    Window { ty: MessageType },
    #[error("{ty} payload of {size} bytes can never fit a packet")]
    PayloadTooLarge { ty: MessageType, size: usize },
    #[error("failed to encode {ty}: {source}")]
    Encode {
        ty: MessageType,
        #[source]
        source: WireError,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// True for failures that clear up once the current packet goes out.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Full { .. } | Self::Window { .. })
    }
}
