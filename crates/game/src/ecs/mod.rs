mod component;
mod entity;
mod flags;
mod history;
mod world;

pub use component::{
    ActionState, Body, ComponentKind, ComponentMask, ConnectionComponent, Input, Movement,
    NetworkStatsComponent, ReplicationMode, Spell, Sprite, Storage,
};
pub use entity::{Entity, EntityAllocator};
pub use flags::{Buttons, EntityFlags};
pub use history::{BodyHistory, DEFAULT_HISTORY_CAPACITY};
pub use world::{Component, PLAYER_RADIUS, World};
