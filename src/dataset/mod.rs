//! Dataset module - line-delimited JSON record store.
//!
//! Provides:
//! - `load_records`: read every record, in file order
//! - `write_records`: atomically replace an output file with a record set
//! - `count_lines_containing`: post-write verification scan

mod jsonl;

pub use jsonl::*;
