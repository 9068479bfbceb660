use bitflags::bitflags;

bitflags! {
    /// Marker components. Replicated as one XOR diff per entity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntityFlags: u16 {
        const PLAYER = 1 << 0;
        const NETWORKED = 1 << 1;
        const STATIC = 1 << 2;
        const INVULNERABLE = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u16 {
        const CAST = 1 << 0;
        const DASH = 1 << 1;
        const INTERACT = 1 << 2;
    }
}
