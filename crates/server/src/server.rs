use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use glam::Vec3;
use log::info;

use meridian::ecs::NetworkStatsComponent;
use meridian::net::{NetError, NetworkStats, Socket};
use meridian::{
    Body, Entity, EntityFlags, NetEvent, NetworkingSystem, ServerSimulation, Sprite, World,
};

use crate::config::ServerConfig;

struct Npc {
    entity: Entity,
    phase: f32,
    radius: f32,
}

pub struct GameServer {
    sim: ServerSimulation,
    config: ServerConfig,
    npcs: Vec<Npc>,
    running: Arc<AtomicBool>,
    start_time: Instant,
    last_tick_time: Instant,
}

impl GameServer {
    pub fn new(config: ServerConfig) -> Result<Self, NetError> {
        let net = NetworkingSystem::bind_server(config.bind, config.net.clone())?;
        let mut sim = ServerSimulation::new(net);

        let npcs = (0..config.npc_count)
            .map(|i| {
                let phase = i as f32 / config.npc_count.max(1) as f32 * TAU;
                let radius = if i % 2 == 0 { config.npc_orbit * 0.3 } else { config.npc_orbit };
                let entity = spawn_npc(sim.world_mut(), i, orbit(phase, radius));
                Npc {
                    entity,
                    phase,
                    radius,
                }
            })
            .collect();

        let now = Instant::now();
        Ok(Self {
            sim,
            config,
            npcs,
            running: Arc::new(AtomicBool::new(true)),
            start_time: now,
            last_tick_time: now,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sim.net().local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> Vec<NetEvent> {
        self.sim.net_mut().drain_events().collect()
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for event in self.drain_events() {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;

        self.move_npcs(now);
        self.sim.update(delta, now);
    }

    fn move_npcs(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.start_time).as_secs_f32();
        let world = self.sim.world_mut();
        for npc in &self.npcs {
            let angle = npc.phase + elapsed * 0.3;
            if let Some(body) = world.get_mut::<Body>(npc.entity) {
                body.set_position(orbit(angle, npc.radius));
            }
        }
    }

    pub fn kick(&mut self, addr: SocketAddr) {
        if self.sim.disconnect(addr, Instant::now()) {
            info!("kicked {addr}");
        }
    }

    pub fn shutdown(&mut self) {
        self.sim.shutdown(Instant::now());
    }

    pub fn stats(&self) -> ServerStats {
        let world = self.sim.world();
        let peers = self
            .sim
            .net()
            .connections()
            .map(|c| PeerInfo {
                addr: c.addr(),
                entity: c.entity(),
                ping_ms: c.ping_ms(),
                jitter_ms: c.jitter_ms(),
                unacked: c.unacked_count(),
                neighbors: c
                    .entity()
                    .and_then(|e| world.get::<NetworkStatsComponent>(e))
                    .map_or(0, |s| s.neighbors),
                stats: *c.stats(),
            })
            .collect();

        ServerStats {
            uptime: self.start_time.elapsed(),
            tick: world.tick(),
            client_count: self.sim.net().connection_count(),
            max_clients: self.config.net.max_connections,
            entity_count: world.entity_count(),
            socket: self.sim.net().socket().stats(),
            peers,
        }
    }
}

fn orbit(angle: f32, radius: f32) -> Vec3 {
    Vec3::new(angle.cos() * radius, 0.0, angle.sin() * radius)
}

fn spawn_npc(world: &mut World, index: usize, position: Vec3) -> Entity {
    let entity = world.spawn();
    world.set_flags(entity, EntityFlags::NETWORKED);
    world.insert(entity, Body::at(position, 0.5));
    world.insert(
        entity,
        Sprite {
            sheet: 1,
            frame: (index % 4) as u16,
            tint: 0xFFFF_FFFF,
        },
    );
    entity
}

pub fn log_event(event: &NetEvent) {
    match event {
        NetEvent::Connected { addr, entity } => match entity {
            Some(entity) => info!("{addr} joined as {entity}"),
            None => info!("{addr} joined"),
        },
        NetEvent::Disconnected { addr, reason, .. } => info!("{addr} left: {reason}"),
        NetEvent::ServerDiscovered { .. } | NetEvent::PingMeasured { .. } => {}
    }
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub entity: Option<Entity>,
    pub ping_ms: Option<f32>,
    pub jitter_ms: f32,
    pub unacked: usize,
    pub neighbors: usize,
    pub stats: NetworkStats,
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub uptime: Duration,
    pub tick: u32,
    pub client_count: usize,
    pub max_clients: usize,
    pub entity_count: usize,
    pub socket: NetworkStats,
    pub peers: Vec<PeerInfo>,
}
