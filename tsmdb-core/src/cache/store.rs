//! Sharded key → entry map

use super::entry::{Entry, TypeMismatch};
use super::value::{self, Value};
use crate::predicate::Predicate;
use crate::Timestamp;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Entries of the cache, partitioned by key hash.
///
/// Every shard tracks its footprint (value bytes plus key overhead), and the
/// store size is their sum.
#[derive(Debug)]
pub struct Store {
    shards: Vec<Shard>,
}

#[derive(Debug, Default)]
struct Shard {
    entries: RwLock<HashMap<Vec<u8>, Arc<Entry>>>,
    size: AtomicU64,
}

impl Store {
    /// Create an empty store with `shard_count` shards
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Shard::default()).collect();
        Self { shards }
    }

    /// Build a store around existing entries
    pub(crate) fn from_entries(
        shard_count: usize,
        entries: impl IntoIterator<Item = (Vec<u8>, Arc<Entry>)>,
    ) -> Self {
        let store = Self::new(shard_count);
        for (key, entry) in entries {
            let shard = store.shard(&key);
            shard
                .size
                .fetch_add((entry.size() + key.len()) as u64, Ordering::Relaxed);
            shard.entries.write().insert(key, entry);
        }
        store
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let idx = crc32fast::hash(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Append `values` to the entry of `key`, creating it if absent.
    ///
    /// Returns true if the entry was created.
    pub fn write(&self, key: &[u8], values: &[Value]) -> std::result::Result<bool, TypeMismatch> {
        let first = match values.first() {
            Some(v) => v,
            None => return Ok(false),
        };
        let added = value::values_size(values) as u64;
        let shard = self.shard(key);

        // Appends happen under the read lock; removal of an emptied entry takes
        // the write lock, so an append can never land in a removed entry.
        {
            let entries = shard.entries.read();
            if let Some(entry) = entries.get(key) {
                entry.add(values)?;
                shard.size.fetch_add(added, Ordering::Relaxed);
                return Ok(false);
            }
        }

        let mut entries = shard.entries.write();
        if let Some(entry) = entries.get(key) {
            entry.add(values)?;
            shard.size.fetch_add(added, Ordering::Relaxed);
            return Ok(false);
        }

        let entry = Entry::new(first.value_type(), values)?;
        entries.insert(key.to_vec(), Arc::new(entry));
        shard
            .size
            .fetch_add(added + key.len() as u64, Ordering::Relaxed);
        Ok(true)
    }

    /// Entry of `key`, if any
    pub fn entry(&self, key: &[u8]) -> Option<Arc<Entry>> {
        self.shard(key).entries.read().get(key).cloned()
    }

    /// Deduplicate every entry; returns the bytes freed
    pub fn deduplicate(&self) -> u64 {
        let mut freed = 0;
        for shard in &self.shards {
            let entries: Vec<Arc<Entry>> = shard.entries.read().values().cloned().collect();
            let shard_freed: u64 = entries.iter().map(|e| e.deduplicate() as u64).sum();
            sub(&shard.size, shard_freed);
            freed += shard_freed;
        }
        freed
    }

    /// Remove values in `[min, max]` from every key that starts with `prefix`
    /// and matches `predicate`. Emptied entries are removed with their key.
    ///
    /// Returns the bytes freed.
    pub fn delete_prefix_range(
        &self,
        prefix: &[u8],
        min: Timestamp,
        max: Timestamp,
        predicate: Option<&dyn Predicate>,
    ) -> u64 {
        let mut freed = 0;
        for shard in &self.shards {
            let targets: Vec<(Vec<u8>, Arc<Entry>)> = shard
                .entries
                .read()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .filter(|(k, _)| predicate.map_or(true, |p| p.matches(k)))
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect();
            freed += shard.trim(targets, min, max);
        }
        freed
    }

    /// Remove values in `[min, max]` from the listed keys; returns the bytes freed
    pub fn delete_range(&self, keys: &[Vec<u8>], min: Timestamp, max: Timestamp) -> u64 {
        let mut freed = 0;
        for key in keys {
            let shard = self.shard(key);
            let target = shard.entries.read().get(key.as_slice()).cloned();
            if let Some(entry) = target {
                freed += shard.trim(vec![(key.clone(), entry)], min, max);
            }
        }
        freed
    }

    /// All keys, unsorted
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.entries.read().keys().cloned());
        }
        keys
    }

    /// Snapshot of every (key, entry) pair
    pub fn entries(&self) -> Vec<(Vec<u8>, Arc<Entry>)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(
                shard
                    .entries
                    .read()
                    .iter()
                    .map(|(k, e)| (k.clone(), e.clone())),
            );
        }
        out
    }

    /// Number of keys
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.entries.read().len()).sum()
    }

    /// Sum of shard footprints
    pub fn size(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.size.load(Ordering::Relaxed))
            .sum()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl Shard {
    fn trim(&self, targets: Vec<(Vec<u8>, Arc<Entry>)>, min: Timestamp, max: Timestamp) -> u64 {
        let mut freed = 0u64;
        let mut emptied = Vec::new();

        for (key, entry) in targets {
            freed += if min == Timestamp::MIN && max == Timestamp::MAX {
                entry.clear() as u64
            } else {
                entry.filter(min, max) as u64
            };
            if entry.is_empty() {
                emptied.push((key, entry));
            }
        }

        if !emptied.is_empty() {
            let mut entries = self.entries.write();
            for (key, entry) in emptied {
                // Re-check under the write lock; a writer may have refilled it.
                let same = entries
                    .get(&key)
                    .map_or(false, |current| Arc::ptr_eq(current, &entry));
                if same && entry.is_empty() {
                    entries.remove(&key);
                    freed += key.len() as u64;
                }
            }
        }

        sub(&self.size, freed);
        freed
    }
}

fn sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
        Some(cur.saturating_sub(n))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_write_and_size() {
        let store = Store::new(4);
        assert!(store.write(b"foo", &[Value::new(1, 1.0)]).unwrap());
        assert!(!store.write(b"foo", &[Value::new(2, 2.0)]).unwrap());
        assert!(store.write(b"bar", &[Value::new(1, true)]).unwrap());

        assert_eq!(store.count(), 2);
        assert_eq!(store.size(), 3 + 32 + 3 + 9);
    }

    #[test]
    fn test_store_type_conflict_leaves_entry() {
        let store = Store::new(4);
        store.write(b"foo", &[Value::new(1, 1.0)]).unwrap();
        assert!(store.write(b"foo", &[Value::new(2, 2i64)]).is_err());
        assert_eq!(store.size(), 3 + 16);
        assert_eq!(store.entry(b"foo").unwrap().count(), 1);
    }

    #[test]
    fn test_store_delete_removes_empty_entries() {
        let store = Store::new(4);
        store
            .write(b"cpu#!~#a", &[Value::new(1, 1.0), Value::new(5, 5.0)])
            .unwrap();
        store.write(b"cpu#!~#b", &[Value::new(3, 3.0)]).unwrap();
        store.write(b"mem#!~#a", &[Value::new(3, 3.0)]).unwrap();
        let before = store.size();

        let freed = store.delete_prefix_range(b"cpu", 2, 4, None);
        assert_eq!(freed, 16 + 8);
        assert_eq!(store.size(), before - freed);
        assert!(store.entry(b"cpu#!~#b").is_none());
        assert_eq!(store.entry(b"cpu#!~#a").unwrap().count(), 2);

        let freed = store.delete_range(&[b"cpu#!~#a".to_vec()], i64::MIN, i64::MAX);
        assert_eq!(freed, 32 + 8);
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 8 + 16);
    }
}
