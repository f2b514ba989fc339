//! Checkpoint state for the hyde regeneration pipeline.
//!
//! Epistemic foundation:
//! - K_i: Every key of `processed_queries` is in `completed_indices`
//! - K_i: Entries are only ever added; a recorded text is never changed
//! - B_i: A document from disk may violate the superset rule → healed on load
//!
//! Wire format is a single JSON object:
//! `{"processed_queries": {"12": "text"}, "completed_indices": [12]}`

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Progress of a regeneration run, persisted after every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairCheckpoint {
    /// Record index → regenerated hyde text
    #[serde(default)]
    processed_queries: BTreeMap<usize, String>,

    /// Record indices that need no further generation
    #[serde(default)]
    completed_indices: BTreeSet<usize>,
}

impl RepairCheckpoint {
    /// Create an empty checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a regenerated text and mark its index complete.
    pub fn record(&mut self, index: usize, text: impl Into<String>) {
        self.processed_queries.insert(index, text.into());
        self.completed_indices.insert(index);
    }

    /// Whether `index` was completed by this or an earlier run.
    pub fn is_completed(&self, index: usize) -> bool {
        self.completed_indices.contains(&index)
    }

    /// Regenerated texts, by record index.
    pub fn processed(&self) -> &BTreeMap<usize, String> {
        &self.processed_queries
    }

    /// Completed record indices.
    pub fn completed(&self) -> &BTreeSet<usize> {
        &self.completed_indices
    }

    /// Number of completed indices.
    pub fn completed_count(&self) -> usize {
        self.completed_indices.len()
    }

    /// Restore the superset invariant on a document from disk.
    ///
    /// Returns the number of indices that had to be added.
    pub fn heal(&mut self) -> usize {
        let missing: Vec<usize> = self
            .processed_queries
            .keys()
            .filter(|idx| !self.completed_indices.contains(idx))
            .copied()
            .collect();

        if !missing.is_empty() {
            warn!(
                count = missing.len(),
                "Checkpoint had processed entries without completed indices, repairing"
            );
            self.completed_indices.extend(&missing);
        }
        missing.len()
    }

    /// True if `self` could be a later snapshot of `earlier` in the same run.
    pub fn extends(&self, earlier: &RepairCheckpoint) -> bool {
        earlier.completed_indices.is_subset(&self.completed_indices)
            && earlier
                .processed_queries
                .iter()
                .all(|(idx, text)| self.processed_queries.get(idx) == Some(text))
    }
}
