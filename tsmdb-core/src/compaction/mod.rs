//! Level compaction of TSM files
//!
//! Once enough files accumulate, the oldest ones are merged into a single file
//! that keeps the newest input's generation, so files written after the inputs
//! still win on overlapping timestamps. Tombstones are applied while reading, so deleted data does not survive
//! a compaction. Deletes disable compactions for their whole duration: a merge
//! that read a file before a tombstone was written would otherwise bring the
//! deleted values back.

use crate::cache::{self, Value};
use crate::tsm::{FileStore, TsmFile};
use crate::{config, Result, TsmError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Number of files that triggers a compaction
    pub file_trigger: usize,
    /// Maximum files merged in one compaction
    pub max_files_per_compaction: usize,
    /// Interval of the background loop
    pub check_interval_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            file_trigger: config::LEVEL_COMPACTION_TRIGGER,
            max_files_per_compaction: 8,
            check_interval_ms: config::COMPACTION_CHECK_INTERVAL_MS,
        }
    }
}

/// Files selected for one compaction
pub struct CompactionTask {
    files: Vec<Arc<dyn TsmFile>>,
}

impl CompactionTask {
    pub fn generations(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.generation()).collect()
    }

    /// Slot of the merged file: the newest input's generation, one sequence
    /// past it
    fn output_slot(&self) -> Option<(u64, u64)> {
        self.files
            .iter()
            .map(|f| (f.generation(), f.sequence()))
            .max()
            .map(|(generation, sequence)| (generation, sequence + 1))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Merges TSM files of a [`FileStore`]
pub struct LevelCompactor {
    config: CompactionConfig,
    file_store: Arc<FileStore>,
    disabled: AtomicUsize,
    running: Mutex<()>,
    completed: AtomicU64,
}

/// Keeps compactions disabled until dropped
pub struct CompactionsDisabled<'a> {
    compactor: &'a LevelCompactor,
}

impl Drop for CompactionsDisabled<'_> {
    fn drop(&mut self) {
        self.compactor.disabled.fetch_sub(1, Ordering::SeqCst);
        debug!("level compactions re-enabled");
    }
}

impl LevelCompactor {
    pub fn new(config: CompactionConfig, file_store: Arc<FileStore>) -> Self {
        Self {
            config,
            file_store,
            disabled: AtomicUsize::new(0),
            running: Mutex::new(()),
            completed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Disable compactions, waiting for a running one to finish
    pub fn disable(&self) -> CompactionsDisabled<'_> {
        self.disabled.fetch_add(1, Ordering::SeqCst);
        drop(self.running.lock());
        debug!("level compactions disabled");
        CompactionsDisabled { compactor: self }
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst) == 0
    }

    /// Number of compactions completed
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Select files to merge, if a compaction is due
    pub fn plan(&self) -> Option<CompactionTask> {
        if !self.is_enabled() {
            return None;
        }
        let files = self.file_store.files();
        if files.len() < self.config.file_trigger.max(2) {
            return None;
        }

        let take = files.len().min(self.config.max_files_per_compaction.max(2));
        Some(CompactionTask {
            files: files.into_iter().take(take).collect(),
        })
    }

    /// Merge the task's files into one and swap it into the file store
    pub fn compact(&self, task: CompactionTask) -> Result<()> {
        let _running = self.running.lock();
        if !self.is_enabled() {
            return Err(TsmError::Compaction("compactions are disabled".into()));
        }

        let start = Instant::now();
        let generations = task.generations();
        let Some((generation, sequence)) = task.output_slot() else {
            return Ok(());
        };
        let inputs: Vec<PathBuf> = task.files.iter().map(|f| f.path().to_path_buf()).collect();

        let mut merged: BTreeMap<Vec<u8>, Vec<Value>> = BTreeMap::new();
        for file in &task.files {
            for key in file.keys() {
                let values = file.read(&key)?;
                merged.entry(key).or_default().extend(values);
            }
        }

        let entries: Vec<(Vec<u8>, Vec<Value>)> = merged
            .into_iter()
            .filter_map(|(key, mut values)| {
                cache::deduplicate(&mut values);
                (!values.is_empty()).then_some((key, values))
            })
            .collect();

        let output = if entries.is_empty() {
            None
        } else {
            Some(self.file_store.write_file_at(&entries, generation, sequence)?)
        };
        let output_generation = output.as_ref().map(|f| (f.generation(), f.sequence()));
        self.file_store.replace(&inputs, output)?;

        self.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            inputs = ?generations,
            output = ?output_generation,
            keys = entries.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "level compaction complete"
        );
        Ok(())
    }

    /// Plan and run one compaction; returns true if one ran
    pub fn compact_level(&self) -> Result<bool> {
        match self.plan() {
            Some(task) => {
                self.compact(task)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
