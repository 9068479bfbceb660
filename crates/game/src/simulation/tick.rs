use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info};

use super::action::ActionSystem;
use crate::ecs::{ActionState, World};
use crate::net::{MessageType, NetworkingSystem};
use crate::replication::EntityNetworkingSystem;

/// Longest frame the accumulator will catch up on.
const MAX_FRAME: Duration = Duration::from_millis(250);

pub struct FixedTimestep {
    tick_rate: u32,
    dt: Duration,
    accumulator: Duration,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            dt: Duration::from_secs(1) / tick_rate,
            accumulator: Duration::ZERO,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn dt(&self) -> Duration {
        self.dt
    }

    pub fn accumulate(&mut self, delta: Duration) {
        self.accumulator += delta.min(MAX_FRAME);
    }

    pub fn should_tick(&self) -> bool {
        self.accumulator >= self.dt
    }

    pub fn consume_tick(&mut self) -> bool {
        if self.accumulator >= self.dt {
            self.accumulator -= self.dt;
            true
        } else {
            false
        }
    }

    /// Fraction of the next tick already accumulated.
    pub fn alpha(&self) -> f32 {
        self.accumulator.as_secs_f32() / self.dt.as_secs_f32()
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}

/// Authoritative tick: receive, act, step, replicate, send.
pub struct ServerSimulation {
    world: World,
    net: NetworkingSystem,
    actions: ActionSystem,
    replication: EntityNetworkingSystem,
    timestep: FixedTimestep,
}

impl ServerSimulation {
    pub fn new(net: NetworkingSystem) -> Self {
        let tick_rate = net.config().tick_rate;
        Self {
            world: World::new(tick_rate),
            replication: EntityNetworkingSystem::new(net.config()),
            actions: ActionSystem::new(tick_rate),
            timestep: FixedTimestep::new(tick_rate),
            net,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn net(&self) -> &NetworkingSystem {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut NetworkingSystem {
        &mut self.net
    }

    pub fn timestep(&self) -> &FixedTimestep {
        &self.timestep
    }

    pub fn tick(&mut self, now: Instant) {
        self.net.receive(&mut self.world, now);
        self.actions.run(&mut self.world);
        self.world.step_physics();
        self.replication.run(&mut self.world, &mut self.net, now);
        self.net.send(&mut self.world, now);
        self.world.advance_tick();
    }

    /// Runs as many ticks as `delta` covers. Returns how many ran.
    pub fn update(&mut self, delta: Duration, now: Instant) -> u32 {
        self.timestep.accumulate(delta);
        let mut ticks = 0;
        while self.timestep.consume_tick() {
            self.tick(now);
            ticks += 1;
        }
        ticks
    }

    /// Drops one peer and its player entity.
    pub fn disconnect(&mut self, addr: SocketAddr, now: Instant) -> bool {
        self.net.disconnect(&mut self.world, addr, now)
    }

    pub fn shutdown(&mut self, now: Instant) {
        info!("disconnecting {} peers", self.net.connection_count());
        self.net.disconnect_all(&mut self.world, now);
    }
}

/// Client tick: receive, send this tick's action and predict it locally, send.
pub struct ClientSimulation {
    world: World,
    net: NetworkingSystem,
    actions: ActionSystem,
    timestep: FixedTimestep,
    action: ActionState,
}

impl ClientSimulation {
    pub fn new(net: NetworkingSystem) -> Self {
        let tick_rate = net.config().tick_rate;
        Self {
            world: World::new(tick_rate),
            actions: ActionSystem::new(tick_rate),
            timestep: FixedTimestep::new(tick_rate),
            action: ActionState::default(),
            net,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn net(&self) -> &NetworkingSystem {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut NetworkingSystem {
        &mut self.net
    }

    pub fn timestep(&self) -> &FixedTimestep {
        &self.timestep
    }

    /// Action sent and predicted every tick until replaced.
    pub fn set_action(&mut self, action: ActionState) {
        self.action = action;
    }

    pub fn action(&self) -> ActionState {
        self.action
    }

    pub fn tick(&mut self, now: Instant) {
        self.net.receive(&mut self.world, now);

        let tick = self.world.tick();
        let action = self.action;
        let player = self.net.server_connection_mut().and_then(|connection| {
            let sent = connection.send_message(MessageType::Action, |w| {
                w.write_u32(tick);
                w.write_archived(&action)
            });
            if let Err(e) = sent {
                debug!("action for tick {tick} dropped: {e}");
            }
            connection.entity()
        });
        if let Some(player) = player {
            self.actions.apply(&mut self.world, player, &action);
        }

        self.net.send(&mut self.world, now);
        self.world.advance_tick();
    }

    pub fn update(&mut self, delta: Duration, now: Instant) -> u32 {
        self.timestep.accumulate(delta);
        let mut ticks = 0;
        while self.timestep.consume_tick() {
            self.tick(now);
            ticks += 1;
        }
        ticks
    }

    pub fn shutdown(&mut self, now: Instant) {
        self.net.disconnect_all(&mut self.world, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_timestep_accumulation() {
        let mut ts = FixedTimestep::new(60);

        ts.accumulate(Duration::from_secs(1) / 30);
        assert!(ts.should_tick());
        assert!(ts.consume_tick());
        assert!(ts.consume_tick());
        assert!(!ts.consume_tick());
    }

    #[test]
    fn long_frames_are_clamped() {
        let mut ts = FixedTimestep::new(10);
        ts.accumulate(Duration::from_secs(5));

        let mut ticks = 0;
        while ts.consume_tick() {
            ticks += 1;
        }
        assert_eq!(ticks, 2);
        assert!(ts.alpha() >= 0.0 && ts.alpha() < 1.0);
    }
}
