//! WAL writer implementation

use super::reader::{parse_segment_id, segment_path, segment_paths};
use super::{SyncPolicy, WalConfig, WalEntry};
use crate::cache::WriteBatch;
use crate::{Result, Timestamp};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// WAL writer for appending entries to disk
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Create a new WAL writer.
    ///
    /// Existing segments are left untouched for replay; writing starts in a
    /// new segment after the highest existing id.
    pub fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let segment_id = Self::find_latest_segment(&config.dir)? + 1;
        let file = Self::open_segment(&config.dir, segment_id)?;

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_id,
            bytes_written: 0,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        info!(dir = ?config.dir, segment_id, "WAL opened");

        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Log a cache write; returns the segment it landed in
    pub fn write_multi(&self, values: &WriteBatch) -> Result<u64> {
        self.append(&WalEntry::Write {
            values: values.clone(),
        })
    }

    /// Log a key range delete
    pub fn delete_range(&self, keys: Vec<Vec<u8>>, min: Timestamp, max: Timestamp) -> Result<u64> {
        self.append(&WalEntry::DeleteRange { keys, min, max })
    }

    /// Log a measurement range delete
    pub fn delete_bucket_range(
        &self,
        name: &[u8],
        min: Timestamp,
        max: Timestamp,
        predicate: Option<Vec<u8>>,
    ) -> Result<u64> {
        self.append(&WalEntry::DeleteBucketRange {
            name: name.to_vec(),
            min,
            max,
            predicate,
        })
    }

    /// Append an entry to the WAL
    pub fn append(&self, entry: &WalEntry) -> Result<u64> {
        let serialized = entry.encode(self.config.compression_threshold)?;
        let mut inner = self.inner.lock();

        // Check if we need to rotate to a new segment
        if inner.bytes_written > 0
            && inner.bytes_written + serialized.len() > self.config.segment_size
        {
            self.rotate_segment(&mut inner)?;
        }

        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len();
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        } else {
            inner.file.flush()?;
        }

        Ok(inner.segment_id)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Get current segment ID
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Close the current segment and start a new one.
    ///
    /// Returns the id of the new segment; every lower id is closed.
    pub fn close_segment(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.rotate_segment(&mut inner)?;
        Ok(inner.segment_id)
    }

    /// Closed segments, ordered by id
    pub fn closed_segments(&self) -> Result<Vec<PathBuf>> {
        let current = self.current_segment();
        Ok(segment_paths(&self.config.dir)?
            .into_iter()
            .filter(|p| parse_segment_id(p).map_or(false, |id| id < current))
            .collect())
    }

    /// Remove segments below `segment_id` (used after a snapshot is flushed)
    pub fn truncate_before(&self, segment_id: u64) -> Result<usize> {
        let mut removed = 0;
        for path in segment_paths(&self.config.dir)? {
            if parse_segment_id(&path).map_or(false, |id| id < segment_id) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, before = segment_id, "WAL segments removed");
        }
        Ok(removed)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn sync_inner(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<()> {
        Self::sync_inner(inner)?;

        inner.segment_id += 1;
        let file = Self::open_segment(&self.config.dir, inner.segment_id)?;
        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;
        inner.writes_since_sync = 0;

        debug!(segment_id = inner.segment_id, "WAL segment rotated");
        Ok(())
    }

    fn find_latest_segment(dir: &Path) -> Result<u64> {
        Ok(segment_paths(dir)?
            .iter()
            .filter_map(|p| parse_segment_id(p))
            .max()
            .unwrap_or(0))
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, segment_id))?)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.inner.get_mut().file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Value;
    use tempfile::TempDir;

    fn config(dir: &Path, segment_size: usize) -> WalConfig {
        WalConfig {
            dir: dir.to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
            segment_size,
            ..Default::default()
        }
    }

    fn batch(key: &str, ts: i64) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.insert(key.as_bytes().to_vec(), vec![Value::new(ts, 23.5)]);
        batch
    }

    #[test]
    fn test_wal_writer() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::new(config(temp_dir.path(), 1024)).unwrap();

        let segment = writer.write_multi(&batch("temp,id=1#!~#value", 1000)).unwrap();
        assert_eq!(segment, 1);
        writer.sync().unwrap();
        assert!(segment_path(temp_dir.path(), 1).exists());
    }

    #[test]
    fn test_rotation_by_size() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::new(config(temp_dir.path(), 64)).unwrap();

        for i in 0..5 {
            writer.write_multi(&batch("temp,id=1#!~#value", i)).unwrap();
        }
        assert!(writer.current_segment() > 1);
        assert_eq!(
            segment_paths(temp_dir.path()).unwrap().len() as u64,
            writer.current_segment()
        );
    }

    #[test]
    fn test_reopen_starts_new_segment() {
        let temp_dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::new(config(temp_dir.path(), 1 << 20)).unwrap();
            writer.write_multi(&batch("a#!~#v", 1)).unwrap();
        }
        let writer = WalWriter::new(config(temp_dir.path(), 1 << 20)).unwrap();
        assert_eq!(writer.current_segment(), 2);
        assert_eq!(writer.closed_segments().unwrap().len(), 1);
    }

    #[test]
    fn test_close_and_truncate() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::new(config(temp_dir.path(), 1 << 20)).unwrap();
        writer.write_multi(&batch("a#!~#v", 1)).unwrap();

        let next = writer.close_segment().unwrap();
        assert_eq!(next, 2);
        writer.write_multi(&batch("a#!~#v", 2)).unwrap();
        assert_eq!(writer.closed_segments().unwrap().len(), 1);

        assert_eq!(writer.truncate_before(next).unwrap(), 1);
        assert!(writer.closed_segments().unwrap().is_empty());
        assert_eq!(segment_paths(temp_dir.path()).unwrap().len(), 1);
    }
}
