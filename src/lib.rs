//! Dark Pathfinder library surface.
//!
//! Finds feasible execution paths to chosen instructions of EVM runtime bytecode and the
//! transaction inputs that drive them, recovers the selector dispatch table, and maps
//! storage writes to the slots they may touch. The entry point is [`engine::Project`].

pub mod cfg;
pub mod concrete;
pub mod engine;
pub mod error;
pub mod explorer;
pub mod slicing;
pub mod symbolic;
pub mod utils;

pub use engine::Project;
pub use error::{PathfinderError, Result};
