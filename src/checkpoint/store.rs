//! Checkpoint persistence.
//!
//! Epistemic foundation:
//! - K_i: State is persisted atomically (write-then-rename)
//! - B_i: Checkpoint file may not exist → empty checkpoint
//! - I^B: Crash or corruption during write → backup file provides recovery
//!
//! - `FileCheckpointStore`: write-then-rename, previous version kept as backup
//! - `MemoryCheckpointStore`: keeps every persisted snapshot, no filesystem

use super::RepairCheckpoint;
use crate::models::{RepairError, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Load/persist boundary for regeneration progress.
///
/// `persist` replaces the stored checkpoint wholesale.
pub trait CheckpointStore {
    /// Load the stored checkpoint, or an empty one if none exists.
    fn load(&self) -> Result<RepairCheckpoint>;

    /// Overwrite the stored checkpoint.
    fn persist(&self, checkpoint: &RepairCheckpoint) -> Result<()>;
}

/// Checkpoint stored as a single JSON document on disk.
pub struct FileCheckpointStore {
    /// Path to main checkpoint file
    path: PathBuf,
    /// Path to backup file
    backup_path: PathBuf,
    /// Path to in-progress write
    temp_path: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store for `path`. Nothing is touched until load/persist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            backup_path: sibling(&path, ".backup.json"),
            temp_path: sibling(&path, ".tmp"),
            path,
        }
    }

    /// Check if a checkpoint exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Path to the main checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<RepairCheckpoint> {
        let file = File::open(path).map_err(|e| RepairError::io("opening checkpoint", e))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| RepairError::ParseError(format!("Invalid checkpoint {}: {e}", path.display())))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<RepairCheckpoint> {
        if !self.exists() {
            info!(path = %self.path.display(), "No checkpoint found, starting fresh");
            return Ok(RepairCheckpoint::new());
        }

        let mut checkpoint = match Self::read(&self.path) {
            Ok(checkpoint) => checkpoint,
            Err(e) if self.backup_path.exists() => {
                warn!(error = %e, backup = %self.backup_path.display(), "Checkpoint unreadable, falling back to backup");
                Self::read(&self.backup_path)?
            }
            Err(e) => return Err(e),
        };
        checkpoint.heal();

        info!(
            completed = checkpoint.completed_count(),
            processed = checkpoint.processed().len(),
            "Resuming from checkpoint"
        );
        Ok(checkpoint)
    }

    fn persist(&self, checkpoint: &RepairCheckpoint) -> Result<()> {
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| RepairError::io("backing up checkpoint", e))?;
        }

        {
            let file = File::create(&self.temp_path)
                .map_err(|e| RepairError::io("creating temp checkpoint", e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, checkpoint)
                .map_err(|e| RepairError::Internal(format!("Serializing checkpoint: {e}")))?;
            writer
                .flush()
                .map_err(|e| RepairError::io("flushing temp checkpoint", e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| RepairError::io("syncing temp checkpoint", e))?;
        }

        fs::rename(&self.temp_path, &self.path)
            .map_err(|e| RepairError::io("renaming checkpoint", e))?;

        debug!(completed = checkpoint.completed_count(), "Checkpoint saved");
        Ok(())
    }
}

/// In-memory checkpoint store that records every persisted snapshot.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    snapshots: Mutex<Vec<RepairCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing checkpoint, as if left behind by an earlier run.
    pub fn with_checkpoint(checkpoint: RepairCheckpoint) -> Self {
        Self {
            snapshots: Mutex::new(vec![checkpoint]),
        }
    }

    /// Every checkpoint held so far, oldest first.
    pub fn snapshots(&self) -> Vec<RepairCheckpoint> {
        self.lock().clone()
    }

    /// The most recent checkpoint, if any.
    pub fn latest(&self) -> Option<RepairCheckpoint> {
        self.lock().last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RepairCheckpoint>> {
        // A poisoned lock still holds consistent snapshots; each push is atomic.
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<RepairCheckpoint> {
        Ok(self.latest().unwrap_or_default())
    }

    fn persist(&self, checkpoint: &RepairCheckpoint) -> Result<()> {
        self.lock().push(checkpoint.clone());
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| OsString::from("checkpoint"));
    let mut name = stem;
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_without_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path().join("ckpt.json"));

        assert!(!store.exists());
        assert_eq!(store.load().unwrap(), RepairCheckpoint::new());
        assert!(!store.exists());
    }

    #[test]
    fn test_persist_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path().join("ckpt.json"));

        let mut checkpoint = RepairCheckpoint::new();
        checkpoint.record(3, "three");
        store.persist(&checkpoint).unwrap();

        assert!(store.exists());
        assert!(!temp_dir.path().join("ckpt.tmp").exists());
        assert_eq!(store.load().unwrap(), checkpoint);
    }

    #[test]
    fn test_persist_overwrites_and_keeps_backup() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path().join("ckpt.json"));

        let mut first = RepairCheckpoint::new();
        first.record(1, "one");
        store.persist(&first).unwrap();

        let mut second = first.clone();
        second.record(2, "two");
        store.persist(&second).unwrap();

        assert_eq!(store.load().unwrap(), second);
        let backup: RepairCheckpoint = serde_json::from_str(
            &fs::read_to_string(temp_dir.path().join("ckpt.backup.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(backup, first);
    }

    #[test]
    fn test_corrupt_checkpoint_falls_back_to_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ckpt.json");
        let store = FileCheckpointStore::new(&path);

        let mut checkpoint = RepairCheckpoint::new();
        checkpoint.record(1, "one");
        store.persist(&checkpoint).unwrap();
        store.persist(&checkpoint).unwrap();
        fs::write(&path, "{truncated").unwrap();

        assert_eq!(store.load().unwrap(), checkpoint);
    }

    #[test]
    fn test_corrupt_checkpoint_without_backup_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ckpt.json");
        fs::write(&path, "not json").unwrap();

        let err = FileCheckpointStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RepairError::ParseError(_)));
    }

    #[test]
    fn test_load_heals_foreign_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ckpt.json");
        fs::write(
            &path,
            r#"{"processed_queries": {"8": "eight"}, "completed_indices": []}"#,
        )
        .unwrap();

        let checkpoint = FileCheckpointStore::new(&path).load().unwrap();
        assert!(checkpoint.is_completed(8));
    }

    #[test]
    fn test_memory_store_keeps_snapshots() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load().unwrap(), RepairCheckpoint::new());

        let mut checkpoint = RepairCheckpoint::new();
        checkpoint.record(1, "a");
        store.persist(&checkpoint).unwrap();
        checkpoint.record(2, "b");
        store.persist(&checkpoint).unwrap();

        assert_eq!(store.snapshots().len(), 2);
        assert_eq!(store.load().unwrap(), checkpoint);
    }
}
