use std::f32::consts::FRAC_PI_2;
use std::time::{Duration, Instant};

use anyhow::Context;
use glam::Vec2;
use log::{info, warn};

use meridian::{
    ActionState, Body, Buttons, ClientSimulation, DisconnectReason, NetEvent, NetworkingSystem,
};

use crate::config::{ClientConfig, Target};

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Finished,
    Disconnected(DisconnectReason),
}

pub struct GameClient {
    sim: ClientSimulation,
    config: ClientConfig,
    leg: u32,
    last_turn: Instant,
    last_status: Instant,
    was_connected: bool,
}

impl GameClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut net = NetworkingSystem::bind_client(config.net.clone())?;
        let now = Instant::now();
        match config.target {
            Target::Address(addr) => net
                .connect(addr, now)
                .with_context(|| format!("connecting to {addr}"))?,
            Target::Discover(group) => {
                info!("looking for servers on {group}");
                net.discover(group);
            }
        }

        Ok(Self {
            sim: ClientSimulation::new(net),
            config,
            leg: 0,
            last_turn: now,
            last_status: now,
            was_connected: false,
        })
    }

    pub fn run(&mut self) -> Exit {
        let start = Instant::now();
        let mut last_frame = start;

        loop {
            let now = Instant::now();
            if self
                .config
                .duration
                .is_some_and(|limit| now.duration_since(start) >= limit)
            {
                self.sim.shutdown(now);
                return Exit::Finished;
            }

            self.wander(now);
            self.sim.update(now - last_frame, now);
            last_frame = now;

            if let Some(exit) = self.handle_events(now) {
                return exit;
            }

            if now.duration_since(self.last_status) >= self.config.status_interval {
                self.last_status = now;
                self.log_status();
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn handle_events(&mut self, now: Instant) -> Option<Exit> {
        let events: Vec<NetEvent> = self.sim.net_mut().drain_events().collect();
        for event in events {
            match event {
                NetEvent::ServerDiscovered { addr, info } => {
                    if self.sim.net().connection_count() > 0 {
                        continue;
                    }
                    info!(
                        "found {:?} at {addr} ({}/{} players)",
                        info.name, info.players, info.max_players
                    );
                    self.sim.net_mut().stop_discovery();
                    if let Err(e) = self.sim.net_mut().connect(addr, now) {
                        warn!("could not reach {addr}: {e}");
                    }
                }
                NetEvent::Connected { addr, entity } => {
                    self.was_connected = true;
                    match entity {
                        Some(entity) => info!("connected to {addr} as {entity}"),
                        None => info!("connected to {addr}"),
                    }
                }
                NetEvent::Disconnected { addr, reason, .. } => {
                    warn!("lost {addr}: {reason}");
                    match self.config.target {
                        Target::Discover(group) if !self.was_connected => {
                            self.sim.net_mut().discover(group);
                        }
                        _ => return Some(Exit::Disconnected(reason)),
                    }
                }
                NetEvent::PingMeasured { .. } => {}
            }
        }
        None
    }

    /// Walks in a straight line and turns a quarter circle every period.
    /// Dashes on every other leg.
    fn wander(&mut self, now: Instant) {
        if now.duration_since(self.last_turn) >= self.config.wander_period {
            self.last_turn = now;
            self.leg = (self.leg + 1) % 4;
        }

        let direction = Vec2::from_angle(self.leg as f32 * FRAC_PI_2);
        let buttons = if self.leg % 2 == 1 {
            Buttons::DASH
        } else {
            Buttons::empty()
        };

        self.sim.set_action(ActionState {
            buttons: buttons.bits(),
            move_axis: direction.to_array(),
            aim: direction.to_array(),
        });
    }

    fn log_status(&self) {
        let net = self.sim.net();
        let Some(connection) = net.server_connection() else {
            info!("waiting for server");
            return;
        };

        let world = self.sim.world();
        let position = connection
            .entity()
            .and_then(|e| world.get::<Body>(e))
            .map(|b| b.position());
        let ping = connection
            .ping_ms()
            .map_or_else(|| "-".to_string(), |p| format!("{p:.1}ms"));

        info!(
            "tick {} | ping {ping} | entities {} | unacked {} | position {}",
            world.tick(),
            world.entity_count(),
            connection.unacked_count(),
            position.map_or_else(|| "-".to_string(), |p| format!("{p:.2}")),
        );
    }
}
