mod action;
mod tick;

pub use action::{ActionSystem, SNAP_THRESHOLD};
pub use tick::{ClientSimulation, FixedTimestep, ServerSimulation};
