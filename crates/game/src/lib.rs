pub mod ecs;
pub mod net;
pub mod physics;
pub mod replication;
pub mod simulation;

pub use ecs::{
    ActionState, Body, Buttons, Component, ComponentKind, ConnectionComponent, Entity,
    EntityFlags, Input, Movement, NetworkStatsComponent, ReplicationMode, Spell, Sprite, World,
};
pub use net::{
    Channel, Connection, ConnectionState, DEFAULT_PORT, DEFAULT_TICK_RATE, DisconnectReason,
    MessageType, NetConfig, NetError, NetEvent, NetworkingSystem, Role, SendError, ServerInfo,
};
pub use physics::PhysicsWorld;
pub use replication::{EntityNetworkingSystem, NeighborRecord, NeighborState, Neighbors};
pub use simulation::{ActionSystem, ClientSimulation, FixedTimestep, ServerSimulation};
