use std::fmt;

/// Generational entity handle. A recycled index never compares equal to the
/// handle it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Packed form used on the wire and in physics user data.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free: Vec<u32>,
    count: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Entity {
        self.count += 1;
        if let Some(index) = self.free.pop() {
            let slot = index as usize;
            self.generations[slot] = self.generations[slot].wrapping_add(1);
            self.alive[slot] = true;
            return Entity {
                index,
                generation: self.generations[slot],
            };
        }

        let index = self.generations.len() as u32;
        self.generations.push(0);
        self.alive.push(true);
        Entity {
            index,
            generation: 0,
        }
    }

    pub fn free(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        self.alive[entity.index as usize] = false;
        self.free.push(entity.index);
        self.count -= 1;
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        let slot = entity.index as usize;
        slot < self.alive.len() && self.alive[slot] && self.generations[slot] == entity.generation
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|&(_, &alive)| alive)
            .map(|(slot, _)| Entity {
                index: slot as u32,
                generation: self.generations[slot],
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_index_gets_new_generation() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        assert!(alloc.free(a));
        let b = alloc.allocate();

        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(!alloc.is_alive(a));
        assert!(alloc.is_alive(b));
        assert!(!alloc.free(a));
        assert_eq!(alloc.len(), 1);
    }

    #[test]
    fn bits_round_trip() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        alloc.free(a);
        let b = alloc.allocate();
        assert_eq!(Entity::from_bits(b.to_bits()), b);
        assert_eq!(b.to_bits() >> 32, 1);
    }
}
