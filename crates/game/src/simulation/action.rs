use glam::Vec3;
use log::debug;

use crate::ecs::{ActionState, Body, Buttons, Entity, Input, Movement, Spell, World};

/// Distance between predicted and authoritative position beyond which the
/// client stops trusting its prediction.
pub const SNAP_THRESHOLD: f32 = 1.0;

/// Turns each entity's latest `Input` into movement and spell casts.
pub struct ActionSystem {
    dt: f32,
}

impl ActionSystem {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            dt: 1.0 / tick_rate.max(1) as f32,
        }
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn run(&self, world: &mut World) {
        let actions: Vec<(Entity, ActionState)> = world
            .query::<Input>()
            .map(|(entity, input)| (entity, input.action))
            .collect();

        for (entity, action) in actions {
            self.apply(world, entity, &action);
        }
    }

    pub fn apply(&self, world: &mut World, entity: Entity, action: &ActionState) {
        let movement = world.get::<Movement>(entity).copied().unwrap_or_default();
        let buttons = action.buttons();

        let axis = action.move_axis().clamp_length_max(1.0);
        let speed = if buttons.contains(Buttons::DASH) {
            movement.dash_speed
        } else {
            movement.speed
        };
        let velocity = Vec3::new(axis.x, 0.0, axis.y) * speed;

        if let Some(body) = world.get_mut::<Body>(entity) {
            let position = body.position() + velocity * self.dt;
            body.set_position(position);
            body.set_velocity(velocity);
        }

        let [aim_x, aim_y] = action.aim;
        if aim_x != 0.0 || aim_y != 0.0 {
            if let Some(movement) = world.get_mut::<Movement>(entity) {
                movement.facing = aim_y.atan2(aim_x);
            }
        }

        if let Some(spell) = world.get_mut::<Spell>(entity) {
            spell.remaining_ticks = spell.remaining_ticks.saturating_sub(1);
            if buttons.contains(Buttons::CAST) && spell.remaining_ticks == 0 {
                spell.remaining_ticks = spell.cooldown_ticks;
                debug!("{entity} cast spell {}", spell.id);
            }
        }
    }

    /// Moves a predicted entity onto the server's position when the two have
    /// drifted apart. Returns true if it snapped.
    pub fn reconcile(world: &mut World, entity: Entity, authoritative: &Body) -> bool {
        let Some(body) = world.get_mut::<Body>(entity) else {
            return false;
        };
        if body.position().distance(authoritative.position()) <= SNAP_THRESHOLD {
            return false;
        }
        body.set_position(authoritative.position());
        body.set_velocity(authoritative.velocity());
        true
    }
}
