//! Server-side interest management: which entities each player's client knows
//! about, and the create/destroy/component/flag messages that keep it in step.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::ecs::{
    Body, ComponentKind, ComponentMask, ConnectionComponent, Entity, EntityFlags,
    NetworkStatsComponent, ReplicationMode, World,
};
use crate::net::{Connection, MessageType, NetConfig, NetworkingSystem, SendError, Sequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    /// In range, not yet created on the client.
    Added,
    Current,
    /// Out of range this pass; a destroy has been attempted.
    Removed,
    /// Destroy failed; retried on the next pass.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborRecord {
    pub state: NeighborState,
    /// Components the client has been told about.
    pub components: ComponentMask,
    /// Flags as the client last saw them.
    pub flags: EntityFlags,
}

impl NeighborRecord {
    fn added() -> Self {
        Self {
            state: NeighborState::Added,
            components: ComponentMask::default(),
            flags: EntityFlags::empty(),
        }
    }
}

/// Per-player neighbor table, stored on the player entity.
#[derive(Debug, Default, Clone)]
pub struct Neighbors {
    records: HashMap<Entity, NeighborRecord>,
    /// Where the next pass starts sending state, so a full packet does not
    /// starve the same neighbors every time.
    rotation: usize,
}

impl Neighbors {
    pub fn get(&self, entity: Entity) -> Option<&NeighborRecord> {
        self.records.get(&entity)
    }

    pub fn state(&self, entity: Entity) -> Option<NeighborState> {
        self.records.get(&entity).map(|r| r.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Entity, &NeighborRecord)> {
        self.records.iter().map(|(&e, r)| (e, r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What one replication pass managed to send for a player.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub created: usize,
    pub destroyed: usize,
    pub updates: usize,
    pub deferred: usize,
}

pub struct EntityNetworkingSystem {
    interval: Duration,
    small_radius: f32,
    large_radius: f32,
    last_run: Option<Instant>,
}

impl EntityNetworkingSystem {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            interval: config.replication_interval,
            small_radius: config.small_radius,
            large_radius: config.large_radius,
            last_run: None,
        }
    }

    /// Runs a pass for every connected player if the replication interval
    /// has elapsed. Returns whether it ran.
    pub fn run(&mut self, world: &mut World, net: &mut NetworkingSystem, now: Instant) -> bool {
        let due = self
            .last_run
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return false;
        }
        self.last_run = Some(now);
        self.replicate(world, net);
        true
    }

    pub fn replicate(&mut self, world: &mut World, net: &mut NetworkingSystem) {
        world.sync_physics();

        let players: Vec<(Entity, ConnectionComponent)> = world
            .query::<ConnectionComponent>()
            .map(|(entity, c)| (entity, *c))
            .collect();

        for (player, link) in players {
            let Some(connection) = net.connection_mut(link.addr) else {
                continue;
            };
            if !connection.is_connected() {
                continue;
            }
            self.replicate_player(world, player, connection);
        }
    }

    /// One pass for one player: refresh the neighbor set, then write what the
    /// client is missing into the connection's packet.
    pub fn replicate_player(
        &self,
        world: &mut World,
        player: Entity,
        connection: &mut Connection,
    ) -> PassReport {
        let mut neighbors = world.remove::<Neighbors>(player).unwrap_or_default();

        self.update_interest(world, player, &mut neighbors);
        let report = emit(world, player, connection, &mut neighbors);

        if report.deferred > 0 {
            warn!(
                "{}: {} replication messages deferred, packet full",
                connection.addr(),
                report.deferred
            );
        }

        if let Some(stats) = world.get_mut::<NetworkStatsComponent>(player) {
            stats.neighbors = neighbors.len();
        }
        world.insert(player, neighbors);
        report
    }

    fn update_interest(&self, world: &World, player: Entity, neighbors: &mut Neighbors) {
        let Some(center) = world.get::<Body>(player).map(Body::position) else {
            return;
        };

        // Removed records had their destroy attempt last pass. Added ones were
        // never created, so the small query below re-adds them if still close.
        neighbors
            .records
            .retain(|_, r| !matches!(r.state, NeighborState::Removed | NeighborState::Added));
        for record in neighbors.records.values_mut() {
            record.state = NeighborState::Removed;
        }

        for entity in world.query_aabb(center, self.large_radius) {
            if let Some(record) = neighbors.records.get_mut(&entity) {
                record.state = NeighborState::Current;
            }
        }

        for entity in world.query_aabb(center, self.small_radius) {
            if entity == player || !world.flags(entity).contains(EntityFlags::NETWORKED) {
                continue;
            }
            neighbors
                .records
                .entry(entity)
                .or_insert_with(NeighborRecord::added);
        }
    }
}

fn emit(
    world: &World,
    player: Entity,
    connection: &mut Connection,
    neighbors: &mut Neighbors,
) -> PassReport {
    let mut report = PassReport::default();
    let tick = world.tick();

    if let Some(body) = world.get::<Body>(player) {
        let sent = connection.send_message(MessageType::PlayerData, |w| {
            w.write_u32(tick);
            w.write_archived(body)
        });
        tally(&mut report, sent);
    }

    // A send that does not fit leaves its record untouched for the next pass.
    for (&entity, record) in neighbors.records.iter_mut() {
        if record.state != NeighborState::Added {
            continue;
        }
        let sent = connection.send_message(MessageType::EcsEntCreate, |w| {
            w.write_u64(entity.to_bits());
            Ok(())
        });
        if sent.is_ok() {
            record.state = NeighborState::Current;
            report.created += 1;
        } else {
            report.deferred += 1;
        }
    }

    for (&entity, record) in neighbors.records.iter_mut() {
        if record.state != NeighborState::Removed {
            continue;
        }
        let sent = connection.send_message(MessageType::EcsEntDestroy, |w| {
            w.write_u64(entity.to_bits());
            Ok(())
        });
        if sent.is_ok() {
            report.destroyed += 1;
        } else {
            record.state = NeighborState::None;
            report.deferred += 1;
        }
    }

    // State only for components the client had before this pass.
    let mut current: Vec<(Entity, ComponentMask)> = neighbors
        .records
        .iter()
        .filter(|(_, r)| r.state == NeighborState::Current)
        .map(|(&e, r)| (e, r.components))
        .collect();
    if !current.is_empty() {
        current.sort_unstable_by_key(|&(e, _)| e.to_bits());
        let len = current.len();
        current.rotate_left(neighbors.rotation % len);
        neighbors.rotation = neighbors.rotation.wrapping_add(1);
    }

    for (&entity, record) in neighbors.records.iter_mut() {
        if record.state != NeighborState::Current {
            continue;
        }
        update_components(world, entity, record, connection, &mut report);
        update_flags(world, entity, record, connection, &mut report);
    }

    for (entity, components) in current {
        send_state(world, entity, components, connection, tick, &mut report);
    }

    report
}

/// Adds and removals, on the ordered channel.
fn update_components(
    world: &World,
    entity: Entity,
    record: &mut NeighborRecord,
    connection: &mut Connection,
    report: &mut PassReport,
) {
    for kind in ComponentKind::ALL {
        if !kind.is_replicated() {
            continue;
        }

        let present = world.has_kind(entity, kind);
        let sent = record.components.contains(kind);

        if present && !sent {
            let result =
                send_component(world, connection, MessageType::EcsCompAdd, entity, kind, None);
            if result.is_ok() {
                record.components.insert(kind);
            }
            tally(report, result);
        } else if !present && sent {
            let result = connection.send_message(MessageType::EcsCompRemove, |w| {
                w.write_u64(entity.to_bits());
                w.write_u8(kind as u8);
                Ok(())
            });
            if result.is_ok() {
                record.components.remove(kind);
            }
            tally(report, result);
        }
    }
}

/// Full state for every component the client already has.
fn send_state(
    world: &World,
    entity: Entity,
    components: ComponentMask,
    connection: &mut Connection,
    tick: u32,
    report: &mut PassReport,
) {
    for kind in ComponentKind::ALL {
        if !components.contains(kind) || !world.has_kind(entity, kind) {
            continue;
        }
        match kind.replication() {
            ReplicationMode::Always => {
                let result = send_component(
                    world,
                    connection,
                    MessageType::EcsCompAlways,
                    entity,
                    kind,
                    Some(tick),
                );
                tally(report, result);
            }
            ReplicationMode::Update => {
                // TODO: send UPDATE components when they change once components carry a dirty tick.
                trace!("{entity}: {kind:?} change tracking not implemented");
            }
            ReplicationMode::None => {}
        }
    }
}

fn update_flags(
    world: &World,
    entity: Entity,
    record: &mut NeighborRecord,
    connection: &mut Connection,
    report: &mut PassReport,
) {
    let diff = world.flags(entity) ^ record.flags;
    if diff.is_empty() {
        return;
    }
    let result = connection.send_message(MessageType::EcsFlag, |w| {
        w.write_u64(entity.to_bits());
        w.write_u16(diff.bits());
        Ok(())
    });
    if result.is_ok() {
        record.flags ^= diff;
    }
    tally(report, result);
}

fn send_component(
    world: &World,
    connection: &mut Connection,
    ty: MessageType,
    entity: Entity,
    kind: ComponentKind,
    tick: Option<u32>,
) -> Result<Sequence, SendError> {
    connection.send_message(ty, |w| {
        w.write_u64(entity.to_bits());
        w.write_u8(kind as u8);
        if let Some(tick) = tick {
            w.write_u32(tick);
        }
        world.write_component(entity, kind, w).map(|_| ())
    })
}

fn tally(report: &mut PassReport, result: Result<Sequence, SendError>) {
    match result {
        Ok(_) => report.updates += 1,
        Err(e) if e.is_capacity() => report.deferred += 1,
        Err(e) => warn!("replication message dropped: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use glam::Vec3;

    use super::*;
    use crate::ecs::{Input, Sprite};
    use crate::net::wire::BufferReader;
    use crate::net::{ConnectionState, MESSAGE_HEADER_SIZE, PACKET_HEADER_SIZE};

    struct Fixture {
        world: World,
        player: Entity,
        connection: Connection,
        system: EntityNetworkingSystem,
    }

    impl Fixture {
        fn new() -> Self {
            let mut world = World::default();
            let player = world.spawn_player(Vec3::ZERO);
            world.insert(player, Neighbors::default());
            let mut connection =
                Connection::new(SocketAddr::from(([127, 0, 0, 1], 4000)), Instant::now());
            connection.set_state(ConnectionState::Connected);
            Self {
                world,
                player,
                connection,
                system: EntityNetworkingSystem::new(&NetConfig::default()),
            }
        }

        fn spawn_npc(&mut self, position: Vec3) -> Entity {
            let npc = self.world.spawn();
            self.world.set_flags(npc, EntityFlags::NETWORKED);
            self.world.insert(npc, Body::at(position, 0.5));
            self.world.insert(
                npc,
                Sprite {
                    sheet: 1,
                    frame: 0,
                    tint: 0,
                },
            );
            npc
        }

        fn pass(&mut self) -> PassReport {
            self.world.sync_physics();
            let report = self
                .system
                .replicate_player(&mut self.world, self.player, &mut self.connection);
            self.clear_packet();
            report
        }

        fn clear_packet(&mut self) {
            self.connection = {
                let mut fresh = Connection::new(self.connection.addr(), Instant::now());
                fresh.set_state(ConnectionState::Connected);
                fresh
            };
        }

        fn state(&self, entity: Entity) -> Option<NeighborState> {
            self.world
                .get::<Neighbors>(self.player)
                .and_then(|n| n.state(entity))
        }

        fn fill_packet(&mut self) {
            while self
                .connection
                .send_message(MessageType::Test, |w| {
                    w.write_bytes(&[0u8; 16]);
                    Ok(())
                })
                .is_ok()
            {}
            while self
                .connection
                .send_message(MessageType::Test, |_| Ok(()))
                .is_ok()
            {}
        }

        fn sent_types(&self) -> Vec<MessageType> {
            let packet = self.connection.pending_packet();
            let mut reader = BufferReader::new(&packet[PACKET_HEADER_SIZE..]);
            let mut types = Vec::new();
            while reader.remaining() >= MESSAGE_HEADER_SIZE {
                let ty = MessageType::try_from(reader.read_u8().unwrap()).unwrap();
                reader.skip(3).unwrap();
                let size = reader.read_u16().unwrap() as usize;
                reader.skip(size).unwrap();
                types.push(ty);
            }
            types
        }
    }

    #[test]
    fn stationary_neighbor_settles_to_current() {
        let mut fx = Fixture::new();
        let npc = fx.spawn_npc(Vec3::new(2.0, 0.0, 0.0));

        let report = fx.pass();
        assert_eq!(report.created, 1);
        assert_eq!(fx.state(npc), Some(NeighborState::Current));

        for _ in 0..5 {
            fx.pass();
            assert_eq!(fx.state(npc), Some(NeighborState::Current));
        }
    }

    #[test]
    fn neighbor_between_radii_stays_current() {
        let mut fx = Fixture::new();
        let npc = fx.spawn_npc(Vec3::new(2.0, 0.0, 0.0));
        fx.pass();

        fx.world.get_mut::<Body>(npc).unwrap().set_position(Vec3::new(12.0, 0.0, 0.0));
        for _ in 0..3 {
            fx.pass();
            assert_eq!(fx.state(npc), Some(NeighborState::Current));
        }
    }

    #[test]
    fn leaving_both_radii_is_two_phase() {
        let mut fx = Fixture::new();
        let npc = fx.spawn_npc(Vec3::new(2.0, 0.0, 0.0));
        fx.pass();

        fx.world.get_mut::<Body>(npc).unwrap().set_position(Vec3::new(50.0, 0.0, 0.0));
        fx.world.sync_physics();
        let report = fx
            .system
            .replicate_player(&mut fx.world, fx.player, &mut fx.connection);
        assert_eq!(report.destroyed, 1);
        assert!(fx.sent_types().contains(&MessageType::EcsEntDestroy));
        assert_eq!(fx.state(npc), Some(NeighborState::Removed));
        fx.clear_packet();

        fx.pass();
        assert_eq!(fx.state(npc), None);
    }

    #[test]
    fn failed_create_stays_added_and_retries() {
        let mut fx = Fixture::new();
        let npc = fx.spawn_npc(Vec3::new(1.0, 0.0, 1.0));

        fx.fill_packet();
        fx.world.sync_physics();
        let report = fx
            .system
            .replicate_player(&mut fx.world, fx.player, &mut fx.connection);
        assert_eq!(report.created, 0);
        assert!(report.deferred > 0);
        assert_eq!(fx.state(npc), Some(NeighborState::Added));
        fx.clear_packet();

        let report = fx.pass();
        assert_eq!(report.created, 1);
        assert_eq!(fx.state(npc), Some(NeighborState::Current));
    }

    #[test]
    fn failed_destroy_is_retried() {
        let mut fx = Fixture::new();
        let npc = fx.spawn_npc(Vec3::new(1.0, 0.0, 1.0));
        fx.pass();

        fx.world.get_mut::<Body>(npc).unwrap().set_position(Vec3::new(80.0, 0.0, 0.0));
        fx.fill_packet();
        fx.world.sync_physics();
        fx.system
            .replicate_player(&mut fx.world, fx.player, &mut fx.connection);
        assert_eq!(fx.state(npc), Some(NeighborState::None));
        fx.clear_packet();

        let report = fx.pass();
        assert_eq!(report.destroyed, 1);
        assert_eq!(fx.state(npc), Some(NeighborState::Removed));
    }

    #[test]
    fn components_are_added_then_sent_always() {
        let mut fx = Fixture::new();
        let npc = fx.spawn_npc(Vec3::new(1.0, 0.0, 0.0));

        fx.world.sync_physics();
        fx.system
            .replicate_player(&mut fx.world, fx.player, &mut fx.connection);
        let first = fx.sent_types();
        assert_eq!(
            first.iter().filter(|&&t| t == MessageType::EcsCompAdd).count(),
            2
        );
        assert!(first.contains(&MessageType::EcsFlag));
        fx.clear_packet();

        fx.world.sync_physics();
        fx.system
            .replicate_player(&mut fx.world, fx.player, &mut fx.connection);
        let second = fx.sent_types();
        assert!(!second.contains(&MessageType::EcsCompAdd));
        assert!(!second.contains(&MessageType::EcsFlag));
        assert_eq!(
            second
                .iter()
                .filter(|&&t| t == MessageType::EcsCompAlways)
                .count(),
            2
        );
        fx.clear_packet();

        fx.world.remove::<Sprite>(npc);
        fx.world.sync_physics();
        fx.system
            .replicate_player(&mut fx.world, fx.player, &mut fx.connection);
        assert!(fx.sent_types().contains(&MessageType::EcsCompRemove));
        let record = *fx.world.get::<Neighbors>(fx.player).unwrap().get(npc).unwrap();
        assert!(!record.components.contains(ComponentKind::Sprite));
        assert!(record.components.contains(ComponentKind::Body));
    }

    #[test]
    fn unreplicated_components_never_leave() {
        let mut fx = Fixture::new();
        let other = fx.world.spawn_player(Vec3::new(1.0, 0.0, 0.0));
        assert!(fx.world.has::<Input>(other));

        fx.pass();
        fx.world.sync_physics();
        fx.system
            .replicate_player(&mut fx.world, fx.player, &mut fx.connection);

        let record = *fx.world.get::<Neighbors>(fx.player).unwrap().get(other).unwrap();
        assert!(!record.components.contains(ComponentKind::Input));
        assert!(record.components.contains(ComponentKind::Spell));

        let packet = fx.connection.pending_packet().to_vec();
        let mut reader = BufferReader::new(&packet[PACKET_HEADER_SIZE..]);
        while reader.remaining() >= MESSAGE_HEADER_SIZE {
            let ty = MessageType::try_from(reader.read_u8().unwrap()).unwrap();
            reader.skip(3).unwrap();
            let size = reader.read_u16().unwrap() as usize;
            let payload = reader.read_bytes(size).unwrap();
            if matches!(ty, MessageType::EcsCompAdd | MessageType::EcsCompAlways) {
                assert_ne!(payload[8], ComponentKind::Input as u8);
            }
        }
    }

    #[test]
    fn player_never_neighbors_itself() {
        let mut fx = Fixture::new();
        fx.pass();
        assert_eq!(fx.state(fx.player), None);
        assert_eq!(fx.world.get::<Neighbors>(fx.player).unwrap().len(), 0);
    }
}
