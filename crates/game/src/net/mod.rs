mod config;
mod connection;
mod dispatch;
mod error;
mod event;
mod handlers;
mod protocol;
mod socket;
mod stats;
mod system;
mod tracking;
pub mod wire;

pub use config::{DEFAULT_MULTICAST_GROUP, NetConfig};
pub use connection::{ACK_RESERVE, Connection, ConnectionState, Inbound, MessageBuilder};
pub use dispatch::{DispatchTable, MessageContext, MessageHandler, Role};
pub use error::{NetError, SendError};
pub use event::{DisconnectReason, NetCommand, NetEvent};
pub use handlers::{client_table, server_table};
pub use protocol::{
    Channel, DEFAULT_PORT, DEFAULT_TICK_RATE, DISCOVER_SIGNATURE, MAX_PACKET_SIZE,
    MESSAGE_HEADER_SIZE, MessageHeader, MessageType, PACKET_HEADER_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, PacketHeader, Sequence, ServerInfo, sequence_diff, sequence_greater_than,
    sequence_less_than,
};
pub use socket::{LoopbackNetwork, LoopbackSocket, Release, Socket, UdpEndpoint};
pub use stats::NetworkStats;
pub use system::NetworkingSystem;
pub use tracking::{
    ACK_WINDOW, AckData, ChannelState, HeldMessage, OrderedBuffer, PendingMessage, ReceiveStatus,
    ReceiveTracker, SendTracker,
};
