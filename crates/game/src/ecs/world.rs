use std::collections::HashMap;

use glam::Vec3;
use rapier3d::prelude::RigidBodyHandle;

use super::component::{
    Body, ComponentKind, ConnectionComponent, Input, Movement, NetworkStatsComponent, Spell,
    Sprite, Storage,
};
use super::entity::{Entity, EntityAllocator};
use super::flags::EntityFlags;
use super::history::BodyHistory;
use crate::net::wire::{BufferReader, BufferWriter, WireError};
use crate::physics::PhysicsWorld;
use crate::replication::Neighbors;

pub const PLAYER_RADIUS: f32 = 0.5;

/// Typed access to the store a component lives in.
pub trait Component: Sized + 'static {
    const KIND: ComponentKind;

    fn storage(world: &World) -> &Storage<Self>;

    fn storage_mut(world: &mut World) -> &mut Storage<Self>;
}

macro_rules! component {
    ($ty:ty, $kind:ident, $field:ident) => {
        impl Component for $ty {
            const KIND: ComponentKind = ComponentKind::$kind;

            fn storage(world: &World) -> &Storage<Self> {
                &world.$field
            }

            fn storage_mut(world: &mut World) -> &mut Storage<Self> {
                &mut world.$field
            }
        }
    };
}

component!(Body, Body, bodies);
component!(Sprite, Sprite, sprites);
component!(Movement, Movement, movements);
component!(Spell, Spell, spells);
component!(Input, Input, inputs);
component!(ConnectionComponent, Connection, connections);
component!(Neighbors, Neighbors, neighbors);
component!(NetworkStatsComponent, NetworkStats, net_stats);

/// Owns every entity, component and the physics mirror of the bodies. One per
/// simulation; nothing here is global.
pub struct World {
    tick: u32,
    entities: EntityAllocator,
    flags: HashMap<Entity, EntityFlags>,
    bodies: Storage<Body>,
    sprites: Storage<Sprite>,
    movements: Storage<Movement>,
    spells: Storage<Spell>,
    inputs: Storage<Input>,
    connections: Storage<ConnectionComponent>,
    neighbors: Storage<Neighbors>,
    net_stats: Storage<NetworkStatsComponent>,
    body_handles: HashMap<Entity, RigidBodyHandle>,
    physics: PhysicsWorld,
    history: BodyHistory,
}

impl Default for World {
    fn default() -> Self {
        Self::new(crate::net::DEFAULT_TICK_RATE)
    }
}

impl World {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            tick: 0,
            entities: EntityAllocator::new(),
            flags: HashMap::new(),
            bodies: Storage::default(),
            sprites: Storage::default(),
            movements: Storage::default(),
            spells: Storage::default(),
            inputs: Storage::default(),
            connections: Storage::default(),
            neighbors: Storage::default(),
            net_stats: Storage::default(),
            body_handles: HashMap::new(),
            physics: PhysicsWorld::new(tick_rate),
            history: BodyHistory::default(),
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn set_tick(&mut self, tick: u32) {
        self.tick = tick;
    }

    pub fn advance_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
    }

    pub fn spawn(&mut self) -> Entity {
        self.entities.allocate()
    }

    /// A player with the gameplay defaults: body, sprite, movement, spell and
    /// input, flagged as a networked player.
    pub fn spawn_player(&mut self, position: Vec3) -> Entity {
        let entity = self.spawn();
        self.flags
            .insert(entity, EntityFlags::PLAYER | EntityFlags::NETWORKED);
        self.bodies.insert(entity, Body::at(position, PLAYER_RADIUS));
        self.sprites.insert(
            entity,
            Sprite {
                sheet: 0,
                frame: 0,
                tint: 0xFFFF_FFFF,
            },
        );
        self.movements.insert(entity, Movement::default());
        self.spells.insert(
            entity,
            Spell {
                id: 1,
                cooldown_ticks: 30,
                remaining_ticks: 0,
            },
        );
        self.inputs.insert(entity, Input::default());
        entity
    }

    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.entities.free(entity) {
            return false;
        }
        self.flags.remove(&entity);
        self.bodies.remove(entity);
        self.sprites.remove(entity);
        self.movements.remove(entity);
        self.spells.remove(entity);
        self.inputs.remove(entity);
        self.connections.remove(entity);
        self.neighbors.remove(entity);
        self.net_stats.remove(entity);
        if let Some(handle) = self.body_handles.remove(&entity) {
            self.physics.remove_body(handle);
        }
        self.history.remove(entity);
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn flags(&self, entity: Entity) -> EntityFlags {
        self.flags.get(&entity).copied().unwrap_or_default()
    }

    pub fn set_flags(&mut self, entity: Entity, flags: EntityFlags) {
        if self.is_alive(entity) {
            self.flags.insert(entity, flags);
        }
    }

    pub fn toggle_flags(&mut self, entity: Entity, diff: EntityFlags) {
        if self.is_alive(entity) {
            *self.flags.entry(entity).or_default() ^= diff;
        }
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        T::storage(self).get(entity)
    }

    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        T::storage_mut(self).get_mut(entity)
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        T::storage(self).contains(entity)
    }

    /// Returns false if the entity is dead.
    pub fn insert<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        T::storage_mut(self).insert(entity, value);
        true
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) -> Option<T> {
        T::storage_mut(self).remove(entity)
    }

    pub fn query<T: Component>(&self) -> impl Iterator<Item = (Entity, &T)> {
        T::storage(self).iter()
    }

    pub fn query_mut<T: Component>(&mut self) -> impl Iterator<Item = (Entity, &mut T)> {
        T::storage_mut(self).iter_mut()
    }

    pub fn has_kind(&self, entity: Entity, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Body => self.bodies.contains(entity),
            ComponentKind::Sprite => self.sprites.contains(entity),
            ComponentKind::Movement => self.movements.contains(entity),
            ComponentKind::Spell => self.spells.contains(entity),
            ComponentKind::Input => self.inputs.contains(entity),
            ComponentKind::Connection => self.connections.contains(entity),
            ComponentKind::Neighbors => self.neighbors.contains(entity),
            ComponentKind::NetworkStats => self.net_stats.contains(entity),
        }
    }

    pub fn remove_kind(&mut self, entity: Entity, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Body => self.bodies.remove(entity).is_some(),
            ComponentKind::Sprite => self.sprites.remove(entity).is_some(),
            ComponentKind::Movement => self.movements.remove(entity).is_some(),
            ComponentKind::Spell => self.spells.remove(entity).is_some(),
            ComponentKind::Input => self.inputs.remove(entity).is_some(),
            ComponentKind::Connection => self.connections.remove(entity).is_some(),
            ComponentKind::Neighbors => self.neighbors.remove(entity).is_some(),
            ComponentKind::NetworkStats => self.net_stats.remove(entity).is_some(),
        }
    }

    /// Archives a replicated component. `Ok(false)` when the entity lacks it
    /// or the kind never goes over the wire.
    pub fn write_component(
        &self,
        entity: Entity,
        kind: ComponentKind,
        writer: &mut BufferWriter,
    ) -> Result<bool, WireError> {
        match kind {
            ComponentKind::Body => write_opt(self.bodies.get(entity), writer),
            ComponentKind::Sprite => write_opt(self.sprites.get(entity), writer),
            ComponentKind::Movement => write_opt(self.movements.get(entity), writer),
            ComponentKind::Spell => write_opt(self.spells.get(entity), writer),
            ComponentKind::Input
            | ComponentKind::Connection
            | ComponentKind::Neighbors
            | ComponentKind::NetworkStats => Ok(false),
        }
    }

    /// Reads an archived component and stores it. Body states with a tick
    /// are also recorded in the interpolation history.
    pub fn read_component(
        &mut self,
        entity: Entity,
        kind: ComponentKind,
        reader: &mut BufferReader<'_>,
        tick: Option<u32>,
    ) -> Result<(), WireError> {
        match kind {
            ComponentKind::Body => {
                let body: Body = reader.read_archived()?;
                if let Some(tick) = tick {
                    self.history.push(entity, tick, body.position());
                }
                self.insert(entity, body);
            }
            ComponentKind::Sprite => {
                let sprite: Sprite = reader.read_archived()?;
                self.insert(entity, sprite);
            }
            ComponentKind::Movement => {
                let movement: Movement = reader.read_archived()?;
                self.insert(entity, movement);
            }
            ComponentKind::Spell => {
                let spell: Spell = reader.read_archived()?;
                self.insert(entity, spell);
            }
            ComponentKind::Input
            | ComponentKind::Connection
            | ComponentKind::Neighbors
            | ComponentKind::NetworkStats => {
                return Err(WireError::InvalidTag {
                    what: "replicated component",
                    tag: kind as u8,
                });
            }
        }
        Ok(())
    }

    pub fn physics(&self) -> &PhysicsWorld {
        &self.physics
    }

    /// Pushes body components into the physics world, creating and removing
    /// rigid bodies as bodies come and go, then steps it so spatial queries
    /// see the result.
    pub fn sync_physics(&mut self) {
        for (entity, body) in self.bodies.iter() {
            match self.body_handles.get(&entity) {
                Some(&handle) => self.physics.set_body_position(handle, body.position()),
                None => {
                    let handle = self.physics.add_body(entity, body.position(), body.radius);
                    self.body_handles.insert(entity, handle);
                }
            }
        }

        let stale: Vec<Entity> = self
            .body_handles
            .keys()
            .copied()
            .filter(|e| !self.bodies.contains(*e))
            .collect();
        for entity in stale {
            if let Some(handle) = self.body_handles.remove(&entity) {
                self.physics.remove_body(handle);
            }
        }
        self.physics.step();
    }

    pub fn step_physics(&mut self) {
        self.sync_physics();
        for (entity, body) in self.bodies.iter_mut() {
            if let Some(position) = self
                .body_handles
                .get(&entity)
                .and_then(|&h| self.physics.body_position(h))
            {
                body.set_position(position);
            }
        }
    }

    /// Entities whose collider touches the box. Reflects body positions as of
    /// the last `sync_physics` or `step_physics`.
    pub fn query_aabb(&self, center: Vec3, half_extent: f32) -> Vec<Entity> {
        self.physics.query_aabb(center, half_extent)
    }

    pub fn history(&self) -> &BodyHistory {
        &self.history
    }

    pub fn record_history(&mut self, entity: Entity, tick: u32) {
        if let Some(body) = self.bodies.get(entity) {
            self.history.push(entity, tick, body.position());
        }
    }

    pub fn interpolated_position(&self, entity: Entity, tick: f32) -> Option<Vec3> {
        self.history
            .interpolated(entity, tick)
            .or_else(|| self.bodies.get(entity).map(Body::position))
    }
}

fn write_opt<T>(value: Option<&T>, writer: &mut BufferWriter) -> Result<bool, WireError>
where
    T: for<'a> rkyv::Serialize<
            rkyv::api::high::HighSerializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::rancor::Error,
            >,
        >,
{
    match value {
        Some(value) => {
            writer.write_archived(value)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_player_has_gameplay_defaults() {
        let mut world = World::default();
        let player = world.spawn_player(Vec3::new(1.0, 2.0, 3.0));

        assert!(world.has::<Body>(player));
        assert!(world.has::<Sprite>(player));
        assert!(world.has::<Movement>(player));
        assert!(world.has::<Spell>(player));
        assert!(world.has::<Input>(player));
        assert_eq!(
            world.flags(player),
            EntityFlags::PLAYER | EntityFlags::NETWORKED
        );
    }

    #[test]
    fn destroy_clears_components_and_physics() {
        let mut world = World::default();
        let player = world.spawn_player(Vec3::ZERO);
        world.sync_physics();
        assert_eq!(world.query_aabb(Vec3::ZERO, 1.0), vec![player]);

        assert!(world.destroy(player));
        assert!(!world.has::<Body>(player));
        world.sync_physics();
        assert!(world.query_aabb(Vec3::ZERO, 1.0).is_empty());
        assert!(!world.destroy(player));
        assert!(!world.insert(player, Sprite { sheet: 0, frame: 0, tint: 0 }));
    }

    #[test]
    fn components_round_trip_through_the_wire() {
        let mut server = World::default();
        let entity = server.spawn_player(Vec3::new(3.0, 0.0, 1.0));

        let mut writer = BufferWriter::new();
        assert!(server
            .write_component(entity, ComponentKind::Body, &mut writer)
            .unwrap());
        assert!(!server
            .write_component(entity, ComponentKind::Input, &mut writer)
            .unwrap());
        let bytes = writer.into_inner();

        let mut client = World::default();
        let local = client.spawn();
        let mut reader = BufferReader::new(&bytes);
        client
            .read_component(local, ComponentKind::Body, &mut reader, Some(7))
            .unwrap();

        assert_eq!(client.get::<Body>(local), server.get::<Body>(entity));
        assert_eq!(client.history().get(local, 7), Some(Vec3::new(3.0, 0.0, 1.0)));
    }
}
