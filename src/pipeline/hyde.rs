//! Hyde regeneration pipeline.
//!
//! Epistemic foundation:
//! - K_i: At most one generation call is in flight
//! - K_i: Checkpoints only grow between persists
//! - I^B: Service failure mid-run → checkpoint saved, run stops, re-run resumes
//!
//! Pipeline flow:
//! Records → Defect scan → Batches → Generator → Checkpoint → Apply → JSONL → Verify
//!
//! The checkpoint is persisted after every batch. That is the recovery
//! boundary: an interrupted run loses at most the batch in flight, and a
//! re-run skips every completed index.

use crate::checkpoint::{CheckpointStore, RepairCheckpoint};
use crate::client::{preview, Generator};
use crate::dataset::{count_lines_containing, load_records, write_records};
use crate::models::{Record, RepairStats, Result, HYDE};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};

/// An ordered group of defective records sent in one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 1-based batch number within this run
    pub number: usize,
    /// (record index, query) in request order
    pub entries: Vec<(usize, String)>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queries in request order.
    pub fn queries(&self) -> Vec<String> {
        self.entries.iter().map(|(_, q)| q.clone()).collect()
    }
}

/// Indices of records whose hyde field contains `pattern`, in input order.
pub fn scan_defects(records: &[Record], pattern: &str) -> Vec<usize> {
    records
        .iter()
        .enumerate()
        .filter(|(_, record)| record.field_contains(HYDE, pattern))
        .map(|(idx, _)| idx)
        .collect()
}

/// Split the not-yet-completed defective indices into batches of `batch_size`.
pub fn plan_batches(
    records: &[Record],
    defective: &[usize],
    checkpoint: &RepairCheckpoint,
    batch_size: usize,
) -> Vec<Batch> {
    let pending: Vec<usize> = defective
        .iter()
        .copied()
        .filter(|idx| !checkpoint.is_completed(*idx))
        .collect();

    pending
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| Batch {
            number: i + 1,
            entries: chunk
                .iter()
                .map(|&idx| (idx, records[idx].query.clone()))
                .collect(),
        })
        .collect()
}

/// Write every checkpointed repair into its record. Returns the number applied.
///
/// The first hyde field is replaced; records without one get it appended.
pub fn apply_repairs(records: &mut [Record], checkpoint: &RepairCheckpoint) -> usize {
    let mut applied = 0;
    for (&idx, text) in checkpoint.processed() {
        match records.get_mut(idx) {
            Some(record) => {
                record.set_field(HYDE, text.as_str());
                applied += 1;
            }
            None => warn!(
                index = idx,
                total = records.len(),
                "Checkpoint entry outside dataset, skipping"
            ),
        }
    }
    applied
}

/// Checkpointed hyde regeneration.
pub struct HydeRepairPipeline<G, S> {
    generator: G,
    store: S,
    bad_pattern: String,
    batch_size: usize,
    show_progress: bool,
}

impl<G: Generator, S: CheckpointStore> HydeRepairPipeline<G, S> {
    pub fn new(generator: G, store: S, bad_pattern: impl Into<String>, batch_size: usize) -> Self {
        Self {
            generator,
            store,
            bad_pattern: bad_pattern.into(),
            batch_size: batch_size.max(1),
            show_progress: true,
        }
    }

    /// Enable or disable the terminal progress bar.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load `input`, repair it, write `output`, then count residual defects.
    pub async fn run(&self, input: &Path, output: &Path) -> Result<RepairStats> {
        let mut records = load_records(input)?;
        self.run_on(&mut records, output).await
    }

    /// Repair already-loaded records, write `output`, then count residual defects.
    pub async fn run_on(&self, records: &mut [Record], output: &Path) -> Result<RepairStats> {
        let mut stats = self.repair(records).await?;

        info!(path = %output.display(), count = records.len(), "Writing output");
        write_records(output, records)?;

        stats.residual = count_lines_containing(output, &self.bad_pattern)?;
        if stats.residual > 0 {
            warn!(residual = stats.residual, "Bad hyde still present in output");
        } else {
            info!("No bad hyde remaining in output");
        }
        Ok(stats)
    }

    /// Number of defective records not yet completed by the stored checkpoint.
    pub fn pending(&self, records: &[Record]) -> Result<usize> {
        let checkpoint = self.store.load()?;
        Ok(scan_defects(records, &self.bad_pattern)
            .into_iter()
            .filter(|idx| !checkpoint.is_completed(*idx))
            .count())
    }

    /// Regenerate every pending defective hyde and apply all checkpointed repairs.
    ///
    /// On a generator error the checkpoint is saved and the error returned;
    /// `records` is left unmodified in that case.
    pub async fn repair(&self, records: &mut [Record]) -> Result<RepairStats> {
        let start = Instant::now();
        let mut stats = RepairStats {
            total_records: records.len(),
            ..Default::default()
        };

        let defective = scan_defects(records, &self.bad_pattern);
        stats.defective = defective.len();
        info!(defective = defective.len(), total = records.len(), "Scanned for bad hyde");

        let mut checkpoint = self.store.load()?;
        let batches = plan_batches(records, &defective, &checkpoint, self.batch_size);
        let pending: usize = batches.iter().map(Batch::len).sum();
        stats.previously_completed = defective.len() - pending;

        info!(
            already_processed = checkpoint.completed_count(),
            remaining = pending,
            batches = batches.len(),
            "Planned regeneration"
        );

        if batches.is_empty() {
            info!("All defective records already processed");
        } else {
            let pb = self.progress_bar(pending as u64);

            for batch in &batches {
                info!(
                    batch = batch.number,
                    of = batches.len(),
                    queries = ?batch.entries.iter().take(3).map(|(_, q)| q.as_str()).collect::<Vec<_>>(),
                    "Processing batch"
                );

                let generated = match self.generator.generate(&batch.queries()).await {
                    Ok(generated) => generated,
                    Err(e) => {
                        error!(batch = batch.number, error = %e, "Error processing batch, saving checkpoint");
                        if let Err(persist_err) = self.store.persist(&checkpoint) {
                            error!(error = %persist_err, "Failed to save checkpoint after batch error");
                        }
                        pb.abandon_with_message(format!("failed at batch {}", batch.number));
                        return Err(e);
                    }
                };

                stats.batches_sent += 1;
                if generated.is_empty() {
                    stats.batches_empty += 1;
                }

                for (pos, (idx, query)) in batch.entries.iter().enumerate() {
                    match generated.get(&(pos + 1)) {
                        Some(text) => {
                            info!(
                                index = idx,
                                query = %preview(query, 40),
                                hyde = %preview(text, 50),
                                "Regenerated"
                            );
                            checkpoint.record(*idx, text.as_str());
                            stats.repaired += 1;
                        }
                        None => {
                            warn!(index = idx, query = %query, "Missing hyde in response");
                            stats.missing += 1;
                        }
                    }
                }

                self.store.persist(&checkpoint)?;
                info!(
                    completed = checkpoint.completed_count(),
                    defective = defective.len(),
                    "Checkpoint saved"
                );

                pb.inc(batch.len() as u64);
                pb.set_message(format!("repaired: {}, missing: {}", stats.repaired, stats.missing));
            }

            pb.finish_with_message(format!(
                "Done! {} repaired, {} missing",
                stats.repaired, stats.missing
            ));
        }

        info!(fixes = checkpoint.processed().len(), "Applying fixes");
        stats.applied = apply_repairs(records, &checkpoint);
        stats.runtime_secs = start.elapsed().as_secs_f64();

        Ok(stats)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
            .map(|s| s.progress_chars("##-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }
}
