//! Core data models for qmd-repair.
//!
//! - Records and fields as stored in the dataset
//! - Configuration loaded from TOML
//! - The error taxonomy shared by both pipelines

mod config;
mod error;
mod record;

pub use config::*;
pub use error::*;
pub use record::*;
