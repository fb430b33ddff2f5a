//! Tombstone sidecar files
//!
//! Deletes against an immutable TSM file are recorded next to it as JSON lines
//! and applied whenever the file is opened.

use crate::{Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A deleted time range of one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub key: Vec<u8>,
    pub min: Timestamp,
    pub max: Timestamp,
}

/// Reads and appends the tombstone file of one TSM file
#[derive(Debug)]
pub struct Tombstoner {
    path: PathBuf,
}

impl Tombstoner {
    /// Tombstoner for the TSM file at `tsm_path`
    pub fn new(tsm_path: &Path) -> Self {
        let mut name = tsm_path.as_os_str().to_owned();
        name.push(".tombstone");
        Self {
            path: PathBuf::from(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably record `tombstones`
    pub fn add(&self, tombstones: &[Tombstone]) -> Result<()> {
        if tombstones.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for t in tombstones {
            serde_json::to_writer(&mut buf, t)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// All recorded tombstones. A torn final line is ignored.
    pub fn load(&self) -> Result<Vec<Tombstone>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tombstones = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(t) => tombstones.push(t),
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "ignoring unreadable tombstone");
                    break;
                }
            }
        }
        Ok(tombstones)
    }

    pub fn has_tombstones(&self) -> bool {
        self.path.exists()
    }

    /// Delete the tombstone file, if any
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tombstones_append_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let t = Tombstoner::new(&temp_dir.path().join("000000001.tsm"));
        assert!(t.load().unwrap().is_empty());
        assert!(t.path().ends_with("000000001.tsm.tombstone"));

        let first = Tombstone {
            key: b"cpu#!~#v".to_vec(),
            min: 0,
            max: 10,
        };
        let second = Tombstone {
            key: b"mem#!~#v".to_vec(),
            min: i64::MIN,
            max: i64::MAX,
        };
        t.add(&[first.clone()]).unwrap();
        t.add(&[second.clone()]).unwrap();
        assert_eq!(t.load().unwrap(), vec![first.clone(), second]);

        let mut f = OpenOptions::new().append(true).open(t.path()).unwrap();
        f.write_all(b"{\"key\":[1,2").unwrap();
        assert_eq!(t.load().unwrap().len(), 2);

        t.remove().unwrap();
        assert!(!t.has_tombstones());
        t.remove().unwrap();
    }
}
