use std::collections::HashMap;

use glam::Vec3;

use super::entity::Entity;

pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

/// Tick-indexed ring of positions for one entity.
#[derive(Debug, Clone)]
struct Track {
    positions: Vec<Vec3>,
    ticks: Vec<u32>,
}

impl Track {
    fn new(capacity: usize) -> Self {
        Self {
            positions: vec![Vec3::ZERO; capacity],
            ticks: vec![u32::MAX; capacity],
        }
    }

    fn push(&mut self, tick: u32, position: Vec3) {
        let index = tick as usize % self.ticks.len();
        self.positions[index] = position;
        self.ticks[index] = tick;
    }

    fn get(&self, tick: u32) -> Option<Vec3> {
        let index = tick as usize % self.ticks.len();
        (self.ticks[index] == tick).then(|| self.positions[index])
    }

    /// Newest sample at or before `tick`, and oldest sample after it.
    fn bracket(&self, tick: u32) -> (Option<(u32, Vec3)>, Option<(u32, Vec3)>) {
        let mut before: Option<(u32, Vec3)> = None;
        let mut after: Option<(u32, Vec3)> = None;
        for (i, &t) in self.ticks.iter().enumerate() {
            if t == u32::MAX {
                continue;
            }
            let sample = (t, self.positions[i]);
            if t <= tick {
                if before.is_none_or(|(bt, _)| t > bt) {
                    before = Some(sample);
                }
            } else if after.is_none_or(|(at, _)| t < at) {
                after = Some(sample);
            }
        }
        (before, after)
    }
}

/// Received body positions by tick, for rendering remote entities between
/// server updates.
#[derive(Debug)]
pub struct BodyHistory {
    tracks: HashMap<Entity, Track>,
    capacity: usize,
}

impl Default for BodyHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl BodyHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            tracks: HashMap::new(),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, entity: Entity, tick: u32, position: Vec3) {
        let capacity = self.capacity;
        self.tracks
            .entry(entity)
            .or_insert_with(|| Track::new(capacity))
            .push(tick, position);
    }

    pub fn get(&self, entity: Entity, tick: u32) -> Option<Vec3> {
        self.tracks.get(&entity)?.get(tick)
    }

    /// Position at a fractional tick. Clamps to the nearest sample outside the
    /// recorded range.
    pub fn interpolated(&self, entity: Entity, tick: f32) -> Option<Vec3> {
        let track = self.tracks.get(&entity)?;
        let whole = tick.max(0.0).floor() as u32;
        match track.bracket(whole) {
            (Some((t0, p0)), Some((t1, p1))) => {
                let alpha = ((tick - t0 as f32) / (t1 - t0) as f32).clamp(0.0, 1.0);
                Some(p0.lerp(p1, alpha))
            }
            (Some((_, p)), None) | (None, Some((_, p))) => Some(p),
            (None, None) => None,
        }
    }

    pub fn remove(&mut self, entity: Entity) {
        self.tracks.remove(&entity);
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::EntityAllocator;

    #[test]
    fn interpolates_between_received_ticks() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        let mut history = BodyHistory::new(16);

        history.push(e, 10, Vec3::ZERO);
        history.push(e, 14, Vec3::new(4.0, 0.0, 0.0));

        assert_eq!(history.interpolated(e, 12.0), Some(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(history.interpolated(e, 20.0), Some(Vec3::new(4.0, 0.0, 0.0)));
        assert_eq!(history.interpolated(e, 5.0), Some(Vec3::ZERO));
    }

    #[test]
    fn overwritten_slots_are_forgotten() {
        let mut alloc = EntityAllocator::new();
        let e = alloc.allocate();
        let mut history = BodyHistory::new(4);

        history.push(e, 1, Vec3::ONE);
        history.push(e, 5, Vec3::ZERO);

        assert_eq!(history.get(e, 1), None);
        assert_eq!(history.get(e, 5), Some(Vec3::ZERO));
    }
}
