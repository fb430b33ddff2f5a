//! TSM file reader and writer
//!
//! Layout:
//! - 4 bytes: magic `TSM1`
//! - 1 byte: format version
//! - 1 byte: flags (bit 0: body is lz4-compressed)
//! - 8 bytes: body length
//! - N bytes: body, bincode list of `(key, values)` sorted by key
//! - 4 bytes: CRC32 of the body as stored

use super::tombstone::{Tombstone, Tombstoner};
use super::{KeyIterator, TsmFile};
use crate::cache::{self, Value};
use crate::predicate::Predicate;
use crate::{Result, TimeRange, Timestamp, TsmError};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File magic
pub const MAGIC: &[u8; 4] = b"TSM1";

/// Current format version
pub const FORMAT_VERSION: u8 = 1;

const FLAG_LZ4: u8 = 0x01;
const HEADER_SIZE: usize = 4 + 1 + 1 + 8;

/// Writes TSM files
pub struct TsmWriter;

impl TsmWriter {
    /// Write `entries` (sorted by key, values sorted and deduplicated) to `path`.
    ///
    /// The file is written under a temporary name and renamed into place, so a
    /// crash never leaves a partial file behind. Returns the file size.
    pub fn write(path: &Path, entries: &[(Vec<u8>, Vec<Value>)], compress: bool) -> Result<u64> {
        let mut body = bincode::serialize(entries)?;
        let mut flags = 0u8;
        if compress {
            body = lz4_flex::compress_prepend_size(&body);
            flags |= FLAG_LZ4;
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len() + 4);
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(flags);
        buf.put_u64_le(body.len() as u64);
        buf.put_slice(&body);
        buf.put_u32_le(crc32fast::hash(&body));

        let tmp = tmp_path(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        debug!(path = ?path, keys = entries.len(), bytes = buf.len(), "TSM file written");
        Ok(buf.len() as u64)
    }
}

/// Temporary name used while a file is being written
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// An open TSM file.
///
/// The body is small enough to keep decoded in memory; tombstones are applied
/// on open and on every delete.
pub struct TsmReader {
    path: PathBuf,
    generation: u64,
    sequence: u64,
    size: u64,
    tombstoner: Tombstoner,
    data: RwLock<BTreeMap<Vec<u8>, Vec<Value>>>,
}

impl TsmReader {
    /// Open and validate the file at `path`
    pub fn open(path: impl AsRef<Path>, generation: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read(&path)?;
        let entries = decode(&raw)?;

        let tombstoner = Tombstoner::new(&path);
        let mut data: BTreeMap<Vec<u8>, Vec<Value>> = entries.into_iter().collect();
        for t in tombstoner.load()? {
            apply_tombstone(&mut data, &t);
        }

        Ok(Self {
            path,
            generation,
            sequence: 0,
            size: raw.len() as u64,
            tombstoner,
            data: RwLock::new(data),
        })
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

fn decode(raw: &[u8]) -> Result<Vec<(Vec<u8>, Vec<Value>)>> {
    if raw.len() < HEADER_SIZE + 4 {
        return Err(TsmError::InvalidFormat("TSM file too short".into()));
    }
    if &raw[..4] != MAGIC {
        return Err(TsmError::InvalidFormat("bad TSM magic".into()));
    }

    let mut header = &raw[4..HEADER_SIZE];
    let version = header.get_u8();
    if version != FORMAT_VERSION {
        return Err(TsmError::InvalidFormat(format!(
            "unsupported TSM version {}",
            version
        )));
    }
    let flags = header.get_u8();
    let body_len = header.get_u64_le() as usize;

    let body_end = HEADER_SIZE
        .checked_add(body_len)
        .filter(|end| end + 4 == raw.len())
        .ok_or_else(|| TsmError::Corruption("TSM body length mismatch".into()))?;
    let body = &raw[HEADER_SIZE..body_end];

    let expected = (&raw[body_end..]).get_u32_le();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(TsmError::ChecksumMismatch { expected, actual });
    }

    if flags & FLAG_LZ4 != 0 {
        let plain = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| TsmError::Compression(e.to_string()))?;
        Ok(bincode::deserialize(&plain)?)
    } else {
        Ok(bincode::deserialize(body)?)
    }
}

fn apply_tombstone(data: &mut BTreeMap<Vec<u8>, Vec<Value>>, t: &Tombstone) {
    if let Some(values) = data.get_mut(&t.key) {
        cache::exclude(values, t.min, t.max);
        if values.is_empty() {
            data.remove(&t.key);
        }
    }
}

impl TsmFile for TsmReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn delete_prefix(
        &self,
        name: &[u8],
        min: Timestamp,
        max: Timestamp,
        predicate: Option<&dyn Predicate>,
        on_touched: &(dyn Fn(&[u8]) + Sync),
    ) -> Result<()> {
        let mut data = self.data.write();

        let tombstones: Vec<Tombstone> = data
            .range(name.to_vec()..)
            .take_while(|(k, _)| k.starts_with(name))
            .filter(|(k, _)| predicate.map_or(true, |p| p.matches(k)))
            .filter(|(_, values)| values.iter().any(|v| v.timestamp >= min && v.timestamp <= max))
            .map(|(k, _)| Tombstone {
                key: k.clone(),
                min,
                max,
            })
            .collect();

        if tombstones.is_empty() {
            return Ok(());
        }

        // Persist before applying so a crash cannot resurrect the data.
        self.tombstoner.add(&tombstones)?;
        for t in &tombstones {
            apply_tombstone(&mut data, t);
            on_touched(&t.key);
        }

        debug!(path = ?self.path, keys = tombstones.len(), "TSM prefix deleted");
        Ok(())
    }

    fn iterator(&self, name: &[u8]) -> Result<KeyIterator> {
        let data = self.data.read();
        let keys: Vec<Vec<u8>> = data
            .range(name.to_vec()..)
            .take_while(|(k, _)| k.starts_with(name))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(KeyIterator::new(keys))
    }

    fn read(&self, key: &[u8]) -> Result<Vec<Value>> {
        Ok(self.data.read().get(key).cloned().unwrap_or_default())
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        self.data.read().keys().cloned().collect()
    }

    fn key_count(&self) -> usize {
        self.data.read().len()
    }

    fn time_range(&self) -> Option<TimeRange> {
        let data = self.data.read();
        let mut range: Option<TimeRange> = None;
        for values in data.values() {
            if let (Some(first), Some(last)) = (values.first(), values.last()) {
                range = Some(match range {
                    Some(r) => TimeRange::new(r.start.min(first.timestamp), r.end.max(last.timestamp)),
                    None => TimeRange::new(first.timestamp, last.timestamp),
                });
            }
        }
        range
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn has_tombstones(&self) -> bool {
        self.tombstoner.has_tombstones()
    }

    fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        self.tombstoner.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::KeyEquals;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn sample() -> Vec<(Vec<u8>, Vec<Value>)> {
        vec![
            (
                b"cpu,host=a#!~#v".to_vec(),
                vec![Value::new(1, 1.0), Value::new(5, 5.0)],
            ),
            (b"cpu,host=b#!~#v".to_vec(), vec![Value::new(3, 3.0)]),
            (b"cpu2#!~#v".to_vec(), vec![Value::new(2, 2.0)]),
            (b"mem#!~#v".to_vec(), vec![Value::new(9, true)]),
        ]
    }

    #[test]
    fn test_write_and_open() {
        let temp_dir = TempDir::new().unwrap();
        for compress in [false, true] {
            let path = temp_dir.path().join(format!("{}.tsm", compress as u8));
            let size = TsmWriter::write(&path, &sample(), compress).unwrap();
            assert!(!tmp_path(&path).exists());

            let reader = TsmReader::open(&path, 7).unwrap();
            assert_eq!(reader.generation(), 7);
            assert_eq!(reader.size(), size);
            assert_eq!(reader.key_count(), 4);
            assert_eq!(reader.read(b"cpu,host=a#!~#v").unwrap().len(), 2);
            assert_eq!(reader.time_range(), Some(TimeRange::new(1, 9)));
        }
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1.tsm");
        TsmWriter::write(&path, &sample(), false).unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw[HEADER_SIZE + 3] ^= 0xff;
        fs::write(&path, &raw).unwrap();
        assert!(matches!(
            TsmReader::open(&path, 1),
            Err(TsmError::ChecksumMismatch { .. })
        ));

        fs::write(&path, b"NOPE").unwrap();
        assert!(TsmReader::open(&path, 1).is_err());
    }

    #[test]
    fn test_iterator_is_prefix_scoped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1.tsm");
        TsmWriter::write(&path, &sample(), false).unwrap();
        let reader = TsmReader::open(&path, 1).unwrap();

        let keys: Vec<Vec<u8>> = reader.iterator(b"cpu").unwrap().collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_delete_prefix_persists_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1.tsm");
        TsmWriter::write(&path, &sample(), false).unwrap();
        let reader = TsmReader::open(&path, 1).unwrap();

        let touched = Mutex::new(Vec::new());
        let pred = KeyEquals::new("cpu,host=a#!~#v");
        reader
            .delete_prefix(b"cpu", 0, 2, Some(&pred), &|k: &[u8]| {
                touched.lock().push(k.to_vec())
            })
            .unwrap();
        assert_eq!(touched.lock().clone(), vec![b"cpu,host=a#!~#v".to_vec()]);
        assert_eq!(reader.read(b"cpu,host=a#!~#v").unwrap(), vec![Value::new(5, 5.0)]);

        reader
            .delete_prefix(b"cpu", i64::MIN, i64::MAX, None, &|_: &[u8]| {})
            .unwrap();
        assert_eq!(reader.keys(), vec![b"mem#!~#v".to_vec()]);
        assert!(reader.has_tombstones());

        let reopened = TsmReader::open(&path, 1).unwrap();
        assert_eq!(reopened.keys(), vec![b"mem#!~#v".to_vec()]);

        reopened.remove().unwrap();
        assert!(!path.exists());
        assert!(!reopened.has_tombstones());
    }
}
