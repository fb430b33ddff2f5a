//! WAL segment reader for recovery

use super::WalEntry;
use crate::{Result, TsmError};
use std::fs;
use std::path::{Path, PathBuf};

/// Reads the records of one segment in order.
///
/// Yields every valid record; the first malformed or truncated record ends the
/// iteration with a [`TsmError::CorruptSegment`] error. [`SegmentReader::offset`]
/// is then the end of the last valid record.
pub struct SegmentReader {
    path: PathBuf,
    data: Vec<u8>,
    offset: usize,
    done: bool,
}

impl SegmentReader {
    /// Open a segment file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        Ok(Self {
            path,
            data,
            offset: 0,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End of the last valid record
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    /// Total bytes in the segment
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Iterator for SegmentReader {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }

        match WalEntry::decode(&self.data[self.offset..]) {
            Ok((entry, consumed)) => {
                self.offset += consumed;
                Some(Ok(entry))
            }
            Err(e) => {
                self.done = true;
                Some(Err(TsmError::CorruptSegment {
                    path: self.path.clone(),
                    offset: self.offset as u64,
                    reason: e.to_string(),
                }))
            }
        }
    }
}

/// Path of segment `id` in `dir`
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", id))
}

/// Segment id encoded in a segment file name
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// Segment files in `dir`, ordered by id
pub fn segment_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments: Vec<(u64, PathBuf)> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }

    segments.sort_by_key(|(id, _)| *id);
    Ok(segments.into_iter().map(|(_, p)| p).collect())
}
