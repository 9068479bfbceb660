use std::collections::HashMap;
use std::net::SocketAddr;

use glam::{Vec2, Vec3};
use rkyv::{Archive, Deserialize, Serialize};

use super::entity::Entity;
use super::flags::Buttons;
use crate::net::wire::WireError;

/// How a component type reaches observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Never leaves the machine that owns it.
    None,
    /// Full state every replication pass while the entity is a neighbor.
    Always,
    /// Sent once when added; change detection is not implemented yet.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ComponentKind {
    Body = 0,
    Sprite = 1,
    Movement = 2,
    Spell = 3,
    Input = 4,
    Connection = 5,
    Neighbors = 6,
    NetworkStats = 7,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 8] = [
        Self::Body,
        Self::Sprite,
        Self::Movement,
        Self::Spell,
        Self::Input,
        Self::Connection,
        Self::Neighbors,
        Self::NetworkStats,
    ];

    pub fn replication(self) -> ReplicationMode {
        match self {
            Self::Body | Self::Sprite | Self::Movement => ReplicationMode::Always,
            Self::Spell => ReplicationMode::Update,
            Self::Input | Self::Connection | Self::Neighbors | Self::NetworkStats => {
                ReplicationMode::None
            }
        }
    }

    pub fn is_replicated(self) -> bool {
        self.replication() != ReplicationMode::None
    }

    pub fn bit(self) -> u64 {
        1u64 << (self as u8)
    }
}

impl TryFrom<u8> for ComponentKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::InvalidTag {
                what: "component kind",
                tag: value,
            })
    }
}

/// Set of component kinds, one bit per `ComponentKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentMask(u64);

impl ComponentMask {
    pub fn contains(self, kind: ComponentKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: ComponentKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: ComponentKind) {
        self.0 &= !kind.bit();
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Body {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub radius: f32,
}

impl Body {
    pub fn at(position: Vec3, radius: f32) -> Self {
        Self {
            position: position.to_array(),
            velocity: [0.0; 3],
            radius,
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn velocity(&self) -> Vec3 {
        Vec3::from_array(self.velocity)
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position.to_array();
    }

    pub fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity.to_array();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Sprite {
    pub sheet: u16,
    pub frame: u16,
    pub tint: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Movement {
    pub speed: f32,
    pub dash_speed: f32,
    pub facing: f32,
}

impl Default for Movement {
    fn default() -> Self {
        Self {
            speed: 4.0,
            dash_speed: 10.0,
            facing: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Spell {
    pub id: u16,
    pub cooldown_ticks: u16,
    pub remaining_ticks: u16,
}

/// One tick of player intent, as carried by `ACTION`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ActionState {
    pub buttons: u16,
    pub move_axis: [f32; 2],
    pub aim: [f32; 2],
}

impl ActionState {
    pub fn buttons(&self) -> Buttons {
        Buttons::from_bits_truncate(self.buttons)
    }

    pub fn move_axis(&self) -> Vec2 {
        Vec2::from_array(self.move_axis)
    }
}

/// Latest action received for an entity and the tick it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Input {
    pub action: ActionState,
    pub tick: u32,
}

/// Links a server-side player entity to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionComponent {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetworkStatsComponent {
    pub ping_ms: f32,
    pub jitter_ms: f32,
    pub unacked: usize,
    pub neighbors: usize,
}

/// Sparse per-type component store.
#[derive(Debug)]
pub struct Storage<T> {
    items: HashMap<Entity, T>,
}

impl<T> Default for Storage<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
        }
    }
}

impl<T> Storage<T> {
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.items.get(&entity)
    }

    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        self.items.get_mut(&entity)
    }

    pub fn insert(&mut self, entity: Entity, value: T) -> Option<T> {
        self.items.insert(entity, value)
    }

    pub fn remove(&mut self, entity: Entity) -> Option<T> {
        self.items.remove(&entity)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.items.contains_key(&entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> {
        self.items.iter().map(|(&e, v)| (e, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Entity, &mut T)> {
        self.items.iter_mut().map(|(&e, v)| (e, v))
    }

    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.items.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_only_components_are_never_replicated() {
        for kind in [
            ComponentKind::Input,
            ComponentKind::Connection,
            ComponentKind::Neighbors,
            ComponentKind::NetworkStats,
        ] {
            assert_eq!(kind.replication(), ReplicationMode::None);
        }
        assert_eq!(ComponentKind::Body.replication(), ReplicationMode::Always);
        assert_eq!(ComponentKind::Spell.replication(), ReplicationMode::Update);
    }

    #[test]
    fn mask_tracks_kinds_independently() {
        let mut mask = ComponentMask::default();
        mask.insert(ComponentKind::Body);
        mask.insert(ComponentKind::Spell);
        mask.remove(ComponentKind::Body);

        assert!(!mask.contains(ComponentKind::Body));
        assert!(mask.contains(ComponentKind::Spell));
        assert_eq!(mask.bits(), 1 << 3);
    }
}
