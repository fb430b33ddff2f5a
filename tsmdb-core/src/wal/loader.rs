//! Cache recovery from WAL segments

use super::{SegmentReader, WalEntry};
use crate::cache::Cache;
use crate::{predicate, Result, TsmError};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome of a [`CacheLoader::load`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub segments: usize,
    pub entries: usize,
    /// Segments whose corrupt tail was cut off
    pub truncated: usize,
    /// Keys skipped because of type conflicts
    pub conflicts: usize,
}

/// Replays WAL segments into a cache
pub struct CacheLoader {
    files: Vec<PathBuf>,
}

impl CacheLoader {
    /// `files` are replayed in the given order
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// Replay every segment into `cache`.
    ///
    /// A malformed record ends the replay of its segment: the records before it
    /// are kept, the file is truncated to the last valid record and loading
    /// continues with the next segment. Type conflicts are skipped; running out
    /// of cache memory aborts the load.
    pub fn load(&self, cache: &Cache) -> Result<LoadStats> {
        let mut stats = LoadStats::default();

        for path in &self.files {
            let start = Instant::now();
            let mut reader = SegmentReader::open(path)?;
            let size = reader.len();
            let mut applied = 0usize;
            let mut corrupt_at = None;

            for next in reader.by_ref() {
                match next {
                    Ok(entry) => {
                        stats.conflicts += apply(cache, entry)?;
                        applied += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "WAL segment corrupt, dropping tail");
                        corrupt_at = Some(reader_offset(&e));
                    }
                }
            }

            if let Some(offset) = corrupt_at {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset)?;
                file.sync_all()?;
                stats.truncated += 1;
            }

            info!(
                path = ?path,
                size,
                entries = applied,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "WAL segment loaded"
            );
            stats.segments += 1;
            stats.entries += applied;
        }

        Ok(stats)
    }
}

fn reader_offset(err: &TsmError) -> u64 {
    match err {
        TsmError::CorruptSegment { offset, .. } => *offset,
        _ => 0,
    }
}

/// Apply one entry; returns the number of keys skipped for type conflicts
fn apply(cache: &Cache, entry: WalEntry) -> Result<usize> {
    match entry {
        WalEntry::Write { values } => match cache.write_multi(&values) {
            Ok(()) => Ok(0),
            Err(TsmError::PartialWrite(partial)) if partial.dropped() == 0 => {
                for failure in &partial.failures {
                    warn!(
                        key = %String::from_utf8_lossy(&failure.key),
                        error = %failure.reason,
                        "skipping WAL values"
                    );
                }
                Ok(partial.failures.len())
            }
            Err(e) => Err(e),
        },
        WalEntry::DeleteRange { keys, min, max } => {
            cache.delete_range(&keys, min, max);
            Ok(0)
        }
        WalEntry::DeleteBucketRange {
            name,
            min,
            max,
            predicate: wire,
        } => {
            let inner = wire.as_deref().map(predicate::unmarshal).transpose()?;
            let scoped = predicate::MeasurementPredicate::new(&name, inner.as_deref());
            cache.delete_bucket_range(&name, min, max, Some(&scoped));
            Ok(0)
        }
    }
}
