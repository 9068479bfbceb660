use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use super::wire::{BufferReader, WireError};

pub const MAX_PACKET_SIZE: usize = 512;
pub const PROTOCOL_VERSION: u8 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4D45_5249;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

pub const PACKET_HEADER_SIZE: usize = 5;
pub const MESSAGE_HEADER_SIZE: usize = 6;

/// Fixed payload of `DISCOVER_SERVER`. Anything else on the discovery group is noise.
pub const DISCOVER_SIGNATURE: [u8; 8] = *b"MERIDIAN";

pub type Sequence = u16;

const SEQUENCE_WRAP_THRESHOLD: u16 = 32768;

#[inline]
pub fn sequence_greater_than(s1: Sequence, s2: Sequence) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[inline]
pub fn sequence_less_than(s1: Sequence, s2: Sequence) -> bool {
    sequence_greater_than(s2, s1)
}

/// Signed distance from `older` to `newer`, positive when `newer` is ahead.
#[inline]
pub fn sequence_diff(newer: Sequence, older: Sequence) -> i32 {
    newer.wrapping_sub(older) as i16 as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Channel {
    Unreliable = 0,
    Reliable = 1,
    Ordered = 2,
}

impl Channel {
    pub const TRACKED: [Channel; 2] = [Channel::Reliable, Channel::Ordered];

    pub fn is_tracked(self) -> bool {
        !matches!(self, Channel::Unreliable)
    }

    /// Index into per-connection tracker arrays. Only valid for tracked channels.
    pub(crate) fn tracked_index(self) -> Option<usize> {
        match self {
            Channel::Unreliable => None,
            Channel::Reliable => Some(0),
            Channel::Ordered => Some(1),
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unreliable),
            1 => Ok(Self::Reliable),
            2 => Ok(Self::Ordered),
            _ => Err(WireError::InvalidTag {
                what: "channel",
                tag: value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    Unknown = 0,
    DiscoverServer = 1,
    ServerInfo = 2,
    Connect = 3,
    ConnectConfirm = 4,
    Disconnect = 5,
    Ping = 6,
    Ack = 7,
    EcsComp = 8,
    EcsCompAdd = 9,
    EcsCompAlways = 10,
    EcsEntCreate = 11,
    EcsEntDestroy = 12,
    EcsFlag = 13,
    Action = 14,
    PlayerData = 15,
    Test = 16,
    EcsCompRemove = 17,
}

impl MessageType {
    pub const ALL: [MessageType; 18] = [
        Self::Unknown,
        Self::DiscoverServer,
        Self::ServerInfo,
        Self::Connect,
        Self::ConnectConfirm,
        Self::Disconnect,
        Self::Ping,
        Self::Ack,
        Self::EcsComp,
        Self::EcsCompAdd,
        Self::EcsCompAlways,
        Self::EcsEntCreate,
        Self::EcsEntDestroy,
        Self::EcsFlag,
        Self::Action,
        Self::PlayerData,
        Self::Test,
        Self::EcsCompRemove,
    ];

    /// The channel every message of this type travels on.
    pub fn channel(self) -> Channel {
        match self {
            Self::ConnectConfirm | Self::Ping => Channel::Reliable,
            Self::EcsComp
            | Self::EcsCompAdd
            | Self::EcsCompRemove
            | Self::EcsEntCreate
            | Self::EcsEntDestroy
            | Self::EcsFlag => Channel::Ordered,
            Self::Unknown
            | Self::DiscoverServer
            | Self::ServerInfo
            | Self::Connect
            | Self::Disconnect
            | Self::Ack
            | Self::EcsCompAlways
            | Self::Action
            | Self::PlayerData
            | Self::Test => Channel::Unreliable,
        }
    }

    /// Smallest payload a well formed message of this type can have.
    pub fn min_size(self) -> usize {
        match self {
            Self::Unknown | Self::Connect | Self::Disconnect | Self::Test => 0,
            Self::DiscoverServer => DISCOVER_SIGNATURE.len(),
            Self::ServerInfo => 2,
            Self::ConnectConfirm => 8 + 4,
            Self::Ping => 1,
            Self::Ack => 1 + 2 + 8,
            Self::EcsEntCreate | Self::EcsEntDestroy => 8,
            Self::EcsComp | Self::EcsCompAdd => 8 + 1 + 2,
            Self::EcsCompAlways => 8 + 1 + 4 + 2,
            Self::EcsCompRemove => 8 + 1,
            Self::EcsFlag => 8 + 2,
            Self::Action | Self::PlayerData => 4 + 2,
        }
    }

    /// Types accepted from an address that has no connection yet.
    pub fn is_pre_handshake(self) -> bool {
        matches!(
            self,
            Self::DiscoverServer | Self::ServerInfo | Self::Connect
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::DiscoverServer => "DISCOVER_SERVER",
            Self::ServerInfo => "SERVER_INFO",
            Self::Connect => "CONNECT",
            Self::ConnectConfirm => "CONNECT_CONFIRM",
            Self::Disconnect => "DISCONNECT",
            Self::Ping => "PING",
            Self::Ack => "ACK",
            Self::EcsComp => "ECS_COMP",
            Self::EcsCompAdd => "ECS_COMP_ADD",
            Self::EcsCompAlways => "ECS_COMP_ALWAYS",
            Self::EcsEntCreate => "ECS_ENT_CREATE",
            Self::EcsEntDestroy => "ECS_ENT_DESTROY",
            Self::EcsFlag => "ECS_FLAG",
            Self::Action => "ACTION",
            Self::PlayerData => "PLAYER_DATA",
            Self::Test => "TEST",
            Self::EcsCompRemove => "ECS_COMP_REMOVE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::InvalidTag {
                what: "message type",
                tag: value,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u8,
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
        }
    }
}

impl PacketHeader {
    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.push(self.version);
    }

    pub fn decode(reader: &mut BufferReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            magic: reader.read_u32()?,
            version: reader.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub ty: MessageType,
    pub channel: Channel,
    pub sequence: Sequence,
    pub size: u16,
}

impl MessageHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.ty as u8);
        out.push(self.channel as u8);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }
}

/// Payload of `SERVER_INFO`, the reply to a LAN discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ServerInfo {
    pub name: String,
    pub players: u16,
    pub max_players: u16,
}
