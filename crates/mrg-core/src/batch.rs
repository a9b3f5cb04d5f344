//! Batch planning and checkpoints
//!
//! The patient population is processed in fixed-size offset windows. A
//! window is recorded as complete only after every submission for it has
//! succeeded, so re-running a backfill skips finished windows and redoes
//! partial ones from scratch.
//!
//! Checkpoints are keyed by the exact `(offset, batch_size, environment)`
//! triple. If the population grows between runs the old windows no longer
//! line up with the new ones; nothing here detects that.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Result};

/// One offset window over the population
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchSpec {
    pub offset: usize,
    pub batch_size: usize,
}

impl BatchSpec {
    /// Number of patients this window covers out of `total_count`
    pub fn span(&self, total_count: usize) -> usize {
        total_count.saturating_sub(self.offset).min(self.batch_size)
    }
}

/// Split `total_count` into `ceil(total_count / batch_size)` windows
pub fn plan_batches(total_count: usize, batch_size: usize) -> std::result::Result<Vec<BatchSpec>, ConfigurationError> {
    if batch_size == 0 {
        return Err(ConfigurationError::ZeroBatchSize);
    }
    Ok((0..total_count)
        .step_by(batch_size)
        .map(|offset| BatchSpec { offset, batch_size })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub offset: usize,
    pub batch_size: usize,
    pub environment: String,
}

impl CheckpointKey {
    pub fn new(offset: usize, batch_size: usize, environment: impl Into<String>) -> Self {
        CheckpointKey {
            offset,
            batch_size,
            environment: environment.into(),
        }
    }
}

/// Append-only record of completed windows. Marking an already completed
/// window must be a no-op.
pub trait CheckpointStore {
    fn is_complete(&self, key: &CheckpointKey) -> Result<bool>;

    fn mark_complete(&mut self, key: &CheckpointKey) -> Result<()>;
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for &mut S {
    fn is_complete(&self, key: &CheckpointKey) -> Result<bool> {
        (**self).is_complete(key)
    }

    fn mark_complete(&mut self, key: &CheckpointKey) -> Result<()> {
        (**self).mark_complete(key)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    completed: HashSet<CheckpointKey>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn is_complete(&self, key: &CheckpointKey) -> Result<bool> {
        Ok(self.completed.contains(key))
    }

    fn mark_complete(&mut self, key: &CheckpointKey) -> Result<()> {
        self.completed.insert(key.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointLine {
    #[serde(flatten)]
    key: CheckpointKey,
    completed_at: DateTime<Utc>,
}

/// Checkpoints persisted as JSON Lines, one completed window per line
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    completed: HashSet<CheckpointKey>,
}

impl FileCheckpointStore {
    /// Open or create the store at `path`.
    ///
    /// A final line that does not parse is taken to be a write cut short by
    /// a crash: it is logged, dropped and truncated away so the next append
    /// starts on a clean line. A bad line anywhere else is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut completed = HashSet::new();

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let lines: Vec<&str> = content.split_inclusive('\n').collect();
            let mut valid_len = 0;
            for (index, line) in lines.iter().enumerate() {
                if !line.trim().is_empty() {
                    match serde_json::from_str::<CheckpointLine>(line.trim()) {
                        Ok(entry) => {
                            completed.insert(entry.key);
                        }
                        Err(err) if index + 1 == lines.len() => {
                            warn!(
                                "Dropping truncated checkpoint line {} in {}: {}",
                                index + 1,
                                path.display(),
                                err
                            );
                            break;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                valid_len += line.len();
            }

            if valid_len < content.len() {
                OpenOptions::new().write(true).open(&path)?.set_len(valid_len as u64)?;
            } else if !content.is_empty() && !content.ends_with('\n') {
                OpenOptions::new().append(true).open(&path)?.write_all(b"\n")?;
            }
            info!("Loaded {} checkpoints from {}", completed.len(), path.display());
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        Ok(FileCheckpointStore { path, completed })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn is_complete(&self, key: &CheckpointKey) -> Result<bool> {
        Ok(self.completed.contains(key))
    }

    fn mark_complete(&mut self, key: &CheckpointKey) -> Result<()> {
        if self.completed.contains(key) {
            return Ok(());
        }
        let line = serde_json::to_string(&CheckpointLine {
            key: key.clone(),
            completed_at: Utc::now(),
        })?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        self.completed.insert(key.clone());
        Ok(())
    }
}

/// Plans windows and tracks their completion for one environment
pub struct BatchCoordinator<S> {
    store: S,
    environment: String,
}

impl<S: CheckpointStore> BatchCoordinator<S> {
    pub fn new(store: S, environment: impl Into<String>) -> Self {
        BatchCoordinator {
            store,
            environment: environment.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn plan_batches(&self, total_count: usize, batch_size: usize) -> Result<Vec<BatchSpec>> {
        Ok(plan_batches(total_count, batch_size)?)
    }

    pub fn has_completed(&self, offset: usize, batch_size: usize, environment: &str) -> Result<bool> {
        self.store
            .is_complete(&CheckpointKey::new(offset, batch_size, environment))
    }

    pub fn mark_completed(&mut self, offset: usize, batch_size: usize, environment: &str) -> Result<()> {
        debug!(
            "Marking batch offset={} size={} env={} complete",
            offset, batch_size, environment
        );
        self.store
            .mark_complete(&CheckpointKey::new(offset, batch_size, environment))
    }

    /// Windows of the plan not yet completed in this coordinator's environment
    pub fn pending_batches(&self, total_count: usize, batch_size: usize) -> Result<Vec<BatchSpec>> {
        let mut pending = Vec::new();
        for batch in self.plan_batches(total_count, batch_size)? {
            if self.has_completed(batch.offset, batch.batch_size, &self.environment)? {
                debug!("Skipping completed batch at offset {}", batch.offset);
            } else {
                pending.push(batch);
            }
        }
        Ok(pending)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MergeError;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("mrg-{}-{}-{}.jsonl", name, std::process::id(), nanos))
    }

    #[test]
    fn test_plan_rounds_up() {
        let batches = plan_batches(2501, 1000).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].offset, 2000);
        assert_eq!(batches[2].span(2501), 501);
        assert_eq!(batches[0].span(2501), 1000);
    }

    #[test]
    fn test_plan_exact_and_empty() {
        assert_eq!(plan_batches(3000, 1000).unwrap().len(), 3);
        assert!(plan_batches(0, 1000).unwrap().is_empty());
        assert_eq!(plan_batches(10, 0).unwrap_err(), ConfigurationError::ZeroBatchSize);
    }

    #[test]
    fn test_completed_batch_skipped_on_replan() {
        let mut coordinator = BatchCoordinator::new(MemoryCheckpointStore::new(), "dev");
        assert_eq!(coordinator.pending_batches(300, 100).unwrap().len(), 3);

        coordinator.mark_completed(100, 100, "dev").unwrap();
        let pending = coordinator.pending_batches(300, 100).unwrap();
        assert_eq!(
            pending.iter().map(|b| b.offset).collect::<Vec<_>>(),
            vec![0, 200]
        );
    }

    #[test]
    fn test_checkpoints_are_scoped_by_size_and_environment() {
        let mut coordinator = BatchCoordinator::new(MemoryCheckpointStore::new(), "prod");
        coordinator.mark_completed(0, 100, "dev").unwrap();
        assert!(coordinator.has_completed(0, 100, "dev").unwrap());
        assert!(!coordinator.has_completed(0, 100, "prod").unwrap());
        assert!(!coordinator.has_completed(0, 50, "dev").unwrap());
    }

    #[test]
    fn test_repeated_mark_is_noop() {
        let mut coordinator = BatchCoordinator::new(MemoryCheckpointStore::new(), "dev");
        coordinator.mark_completed(0, 10, "dev").unwrap();
        coordinator.mark_completed(0, 10, "dev").unwrap();
        assert_eq!(coordinator.store().len(), 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let path = temp_path("reopen");
        {
            let mut store = FileCheckpointStore::open(&path).unwrap();
            store.mark_complete(&CheckpointKey::new(0, 500, "dev")).unwrap();
            store.mark_complete(&CheckpointKey::new(0, 500, "dev")).unwrap();
            store.mark_complete(&CheckpointKey::new(500, 500, "dev")).unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.is_complete(&CheckpointKey::new(500, 500, "dev")).unwrap());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_store_rejects_corrupt_lines() {
        let path = temp_path("corrupt");
        let valid = r#"{"offset":0,"batch_size":10,"environment":"dev","completed_at":"2024-01-01T00:00:00Z"}"#;
        fs::write(&path, format!("{{not json}}\n{}\n", valid)).unwrap();
        let err = FileCheckpointStore::open(&path).unwrap_err();
        assert!(matches!(err, MergeError::Serialization(_)));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_store_drops_truncated_last_line() {
        let path = temp_path("truncated");
        {
            let mut store = FileCheckpointStore::open(&path).unwrap();
            store.mark_complete(&CheckpointKey::new(0, 10, "dev")).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"offset":10,"batch_"#).unwrap();
        drop(file);

        let mut store = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.is_complete(&CheckpointKey::new(10, 10, "dev")).unwrap());
        store.mark_complete(&CheckpointKey::new(10, 10, "dev")).unwrap();
        drop(store);

        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
        fs::remove_file(&path).unwrap();
    }
}
