//! Checkpoint module for resumable regeneration.
//!
//! Provides:
//! - `RepairCheckpoint`: which records are done and what they were repaired to
//! - `CheckpointStore`: load/persist boundary, with file and in-memory stores

mod state;
mod store;

pub use state::*;
pub use store::*;
