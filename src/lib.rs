//! qmd-repair - Repair tooling for query-expansion training datasets.
//!
//! ## Pipelines
//!
//! - **Hyde regeneration**: Scan → Batch → Generate → Checkpoint → Apply → Write → Verify.
//!   Records whose hyde field carries a known boilerplate phrase are sent, in
//!   batches, to a chat-completions endpoint for fresh query-specific text.
//!   Progress is checkpointed after every batch so an interrupted run resumes
//!   where it stopped.
//! - **Lex normalization**: a stateless single pass that strips filler terms
//!   a lex field repeats beyond what its query contains.
//!
//! ## Failure model
//!
//! - Generation service errors stop the run after saving the checkpoint.
//! - An unparseable response loses that batch only; its records stay pending.
//! - A missing position in a response leaves that record pending.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Checkpoint and record invariants held by the types
//! - B_i (Beliefs): Service responses and input lines are fallible (Result, Option)
//! - I^R (Resolvable): File names, model, batch size and fillers from config
//! - I^B (Bounded): Network and rate-limit uncertainty (retry, backoff)

pub mod checkpoint;
pub mod client;
pub mod dataset;
pub mod models;
pub mod pipeline;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, RepairCheckpoint};
pub use client::{ChatClient, Generated, Generator, HydeGenerator, RateLimiter};
pub use models::{Config, Field, NormalizeStats, Record, RepairError, RepairStats, Result};
pub use pipeline::{FillerNormalizer, HydeRepairPipeline};
