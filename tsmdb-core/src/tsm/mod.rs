//! Immutable TSM files
//!
//! Cache snapshots are written out as TSM files: sorted, checksummed files of
//! `(key, values)` pairs. Files are never rewritten in place; deletes go to a
//! tombstone sidecar and compaction replaces whole files.

mod file;
mod tombstone;

pub use file::{tmp_path, TsmReader, TsmWriter, FORMAT_VERSION, MAGIC};
pub use tombstone::{Tombstone, Tombstoner};

use crate::cache::{self, Value};
use crate::predicate::Predicate;
use crate::{Result, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Extension of TSM files
pub const TSM_EXTENSION: &str = "tsm";

/// Operations the engine needs from an on-disk file
pub trait TsmFile: Send + Sync {
    fn path(&self) -> &Path;

    /// Files with higher generations hold newer data
    fn generation(&self) -> u64;

    /// Orders files sharing a generation. A compaction output keeps the
    /// generation of its newest input and takes the next sequence.
    fn sequence(&self) -> u64;

    /// Delete `[min, max]` from every key starting with `name` that matches
    /// `predicate`. `on_touched` is called for every key that lost values.
    fn delete_prefix(
        &self,
        name: &[u8],
        min: Timestamp,
        max: Timestamp,
        predicate: Option<&dyn Predicate>,
        on_touched: &(dyn Fn(&[u8]) + Sync),
    ) -> Result<()>;

    /// Sorted keys starting with `name`
    fn iterator(&self, name: &[u8]) -> Result<KeyIterator>;

    /// Values of `key`, sorted
    fn read(&self, key: &[u8]) -> Result<Vec<Value>>;

    /// All keys, sorted
    fn keys(&self) -> Vec<Vec<u8>>;

    fn key_count(&self) -> usize;

    fn time_range(&self) -> Option<TimeRange>;

    /// Size on disk
    fn size(&self) -> u64;

    fn has_tombstones(&self) -> bool;

    /// Delete the file and its tombstones from disk
    fn remove(&self) -> Result<()>;
}

/// Sorted keys of one file
pub struct KeyIterator {
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl KeyIterator {
    pub fn new(keys: Vec<Vec<u8>>) -> Self {
        Self {
            keys: keys.into_iter(),
        }
    }
}

impl Iterator for KeyIterator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.keys.next()
    }
}

/// The set of open TSM files
pub struct FileStore {
    dir: PathBuf,
    files: RwLock<Vec<Arc<dyn TsmFile>>>,
    next_generation: AtomicU64,
    compress: bool,
}

impl FileStore {
    /// Open every TSM file in `dir`. Leftover temporary files are removed.
    pub fn open(dir: impl AsRef<Path>, compress: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut files: Vec<Arc<dyn TsmFile>> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            if name.ends_with(".tmp") {
                warn!(path = ?path, "removing incomplete TSM file");
                fs::remove_file(&path)?;
                continue;
            }
            if let Some((generation, sequence)) = parse_file_name(&path) {
                files.push(Arc::new(
                    TsmReader::open(&path, generation)?.with_sequence(sequence),
                ));
            }
        }
        sort_files(&mut files);

        let next = files.last().map_or(1, |f| f.generation() + 1);
        info!(dir = ?dir, files = files.len(), "file store opened");

        Ok(Self {
            dir,
            files: RwLock::new(files),
            next_generation: AtomicU64::new(next),
            compress,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a generation for a new file
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Path of the file with `generation` and `sequence`
    pub fn path_for(&self, generation: u64, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("{:09}-{:09}.{}", generation, sequence, TSM_EXTENSION))
    }

    /// Write `entries` as a new file and open it (not yet added)
    pub fn write_file(&self, entries: &[(Vec<u8>, Vec<Value>)]) -> Result<Arc<dyn TsmFile>> {
        let generation = self.next_generation();
        self.write_file_at(entries, generation, 0)
    }

    /// Write `entries` into an explicit slot. Compaction uses this so its
    /// output sorts below every file newer than its inputs.
    pub fn write_file_at(
        &self,
        entries: &[(Vec<u8>, Vec<Value>)],
        generation: u64,
        sequence: u64,
    ) -> Result<Arc<dyn TsmFile>> {
        let path = self.path_for(generation, sequence);
        TsmWriter::write(&path, entries, self.compress)?;
        Ok(Arc::new(
            TsmReader::open(&path, generation)?.with_sequence(sequence),
        ))
    }

    /// Start serving reads from `file`
    pub fn add(&self, file: Arc<dyn TsmFile>) {
        let mut files = self.files.write();
        files.push(file);
        sort_files(&mut files);
    }

    /// Swap the files at `old` paths for `new`, deleting the old files from
    /// disk
    pub fn replace(&self, old: &[PathBuf], new: Option<Arc<dyn TsmFile>>) -> Result<()> {
        let removed: Vec<Arc<dyn TsmFile>> = {
            let mut files = self.files.write();
            let (removed, kept): (Vec<_>, Vec<_>) = files
                .drain(..)
                .partition(|f| old.iter().any(|p| p.as_path() == f.path()));
            *files = kept;
            if let Some(new) = new {
                files.push(new);
            }
            sort_files(&mut files);
            removed
        };

        for file in removed {
            file.remove()?;
        }
        Ok(())
    }

    /// Current files, oldest first
    pub fn files(&self) -> Vec<Arc<dyn TsmFile>> {
        self.files.read().clone()
    }

    /// Run `f` on every file in parallel; returns the first error
    pub fn apply<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&dyn TsmFile) -> Result<()> + Sync,
    {
        let files = self.files();
        if files.is_empty() {
            return Ok(());
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::scope(|scope| {
            for file in &files {
                let tx = tx.clone();
                let f = &f;
                scope.spawn(move || {
                    if let Err(e) = f(file.as_ref()) {
                        let _ = tx.send(e);
                    }
                });
            }
        });
        drop(tx);

        match rx.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }

    /// Values of `key` across files; newer files win on equal timestamps
    pub fn read(&self, key: &[u8]) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        for file in self.files() {
            values.extend(file.read(key)?);
        }
        cache::deduplicate(&mut values);
        Ok(values)
    }

    /// All keys across files, sorted
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = BTreeSet::new();
        for file in self.files() {
            keys.extend(file.keys());
        }
        keys.into_iter().collect()
    }

    pub fn count(&self) -> usize {
        self.files.read().len()
    }

    /// Total size on disk
    pub fn size(&self) -> u64 {
        self.files.read().iter().map(|f| f.size()).sum()
    }
}

fn sort_files(files: &mut [Arc<dyn TsmFile>]) {
    files.sort_by_key(|f| (f.generation(), f.sequence()));
}

/// Generation and sequence encoded in a TSM file name
/// (`<generation>-<sequence>.tsm`)
pub fn parse_file_name(path: &Path) -> Option<(u64, u64)> {
    if path.extension().and_then(|e| e.to_str()) != Some(TSM_EXTENSION) {
        return None;
    }
    let stem = path.file_stem().and_then(|s| s.to_str())?;
    let (generation, sequence) = stem.split_once('-')?;
    Some((generation.parse().ok()?, sequence.parse().ok()?))
}

/// Generation encoded in a TSM file name
pub fn parse_generation(path: &Path) -> Option<u64> {
    parse_file_name(path).map(|(generation, _)| generation)
}
