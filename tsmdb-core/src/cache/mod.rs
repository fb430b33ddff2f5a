//! Write cache
//!
//! Every write lands in the cache before it reaches a TSM file. The cache keeps
//! one live [`Store`] and at most one snapshot store being flushed to disk:
//!
//! - writes reserve their size against the memory ceiling, counting the
//!   snapshot too, before touching the store
//! - `snapshot()` swaps the live store aside in O(1); writes continue into a
//!   fresh store while the snapshot is written out
//! - `clear_snapshot(false)` keeps the snapshot so a failed flush can be retried

mod entry;
mod store;
mod value;

pub use entry::{Entry, TypeMismatch};
pub use store::Store;
pub use value::{deduplicate, exclude, values_size, Value};

use crate::predicate::Predicate;
use crate::{config, PartialWriteError, Result, Timestamp, TsmError, ValueType, WriteFailure};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Values to write, keyed by composite key
pub type WriteBatch = BTreeMap<Vec<u8>, Vec<Value>>;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory ceiling in bytes; 0 disables it
    pub max_memory_size: u64,
    /// Size at which the engine flushes a snapshot
    pub snapshot_memory_size: u64,
    /// Shards per store
    pub shard_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_size: config::DEFAULT_CACHE_MAX_MEMORY_SIZE,
            snapshot_memory_size: config::DEFAULT_CACHE_SNAPSHOT_MEMORY_SIZE,
            shard_count: config::STORE_SHARD_COUNT,
        }
    }
}

/// Counters exposed by [`Cache::statistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    /// Live plus snapshot bytes
    pub mem_size_bytes: u64,
    /// Bytes held by the outstanding snapshot
    pub snapshot_bytes: u64,
    /// Keys in the live store
    pub entries: usize,
    pub writes_ok: u64,
    pub writes_err: u64,
    pub writes_dropped: u64,
    pub snapshots: u64,
    pub last_write: Option<DateTime<Utc>>,
    pub last_snapshot: Option<DateTime<Utc>>,
}

struct Stores {
    live: Arc<Store>,
    snapshot: Option<Arc<Store>>,
    snapshotting: bool,
}

/// In-memory write buffer
pub struct Cache {
    max_size: AtomicU64,
    shard_count: usize,

    /// Live store bytes
    size: AtomicU64,
    /// Snapshot store bytes; only changes under the `stores` write lock
    snapshot_size: AtomicU64,

    stores: RwLock<Stores>,

    writes_ok: AtomicU64,
    writes_err: AtomicU64,
    writes_dropped: AtomicU64,
    snapshots: AtomicU64,
    last_write_ms: AtomicI64,
    last_snapshot_ms: AtomicI64,
}

impl Cache {
    /// Create a cache with the given ceiling (0 = unlimited)
    pub fn new(max_size: u64) -> Self {
        Self::with_shards(max_size, config::STORE_SHARD_COUNT)
    }

    /// Create a cache from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_shards(config.max_memory_size, config.shard_count)
    }

    fn with_shards(max_size: u64, shard_count: usize) -> Self {
        Self {
            max_size: AtomicU64::new(max_size),
            shard_count,
            size: AtomicU64::new(0),
            snapshot_size: AtomicU64::new(0),
            stores: RwLock::new(Stores {
                live: Arc::new(Store::new(shard_count)),
                snapshot: None,
                snapshotting: false,
            }),
            writes_ok: AtomicU64::new(0),
            writes_err: AtomicU64::new(0),
            writes_dropped: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
            last_write_ms: AtomicI64::new(0),
            last_snapshot_ms: AtomicI64::new(0),
        }
    }

    /// Write values for a single key
    pub fn write(&self, key: &[u8], values: &[Value]) -> Result<()> {
        let result = {
            let stores = self.stores.read();
            self.write_key(&stores, key, values)
        };

        match &result {
            Ok(()) => {
                self.writes_ok.fetch_add(1, Ordering::Relaxed);
                self.touch_write();
            }
            Err(e) => {
                self.writes_err.fetch_add(1, Ordering::Relaxed);
                if e.is_capacity_exceeded() {
                    self.writes_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        result
    }

    /// Write values for many keys. Each key succeeds or fails on its own;
    /// failures are reported together as [`TsmError::PartialWrite`].
    pub fn write_multi(&self, batch: &WriteBatch) -> Result<()> {
        let mut failed = PartialWriteError::default();
        let mut applied = 0usize;

        {
            let stores = self.stores.read();
            for (key, values) in batch {
                match self.write_key(&stores, key, values) {
                    Ok(()) => applied += 1,
                    Err(reason) => failed.failures.push(WriteFailure {
                        key: key.clone(),
                        reason,
                    }),
                }
            }
        }

        if applied > 0 {
            self.touch_write();
        }

        if failed.is_empty() {
            self.writes_ok.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.writes_err.fetch_add(1, Ordering::Relaxed);
        if failed.dropped() > 0 {
            self.writes_dropped.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            applied,
            failed = failed.failures.len(),
            "cache write_multi partially rejected"
        );
        Err(TsmError::PartialWrite(failed))
    }

    fn write_key(&self, stores: &Stores, key: &[u8], values: &[Value]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let added = values_size(values) as u64;
        self.reserve(added)?;

        match stores.live.write(key, values) {
            Ok(new_key) => {
                if new_key {
                    self.size.fetch_add(key.len() as u64, Ordering::AcqRel);
                }
                Ok(())
            }
            Err(mismatch) => {
                sub(&self.size, added);
                Err(TsmError::type_conflict(
                    key,
                    mismatch.existing,
                    mismatch.attempted,
                ))
            }
        }
    }

    /// Reserve `bytes` of live size against the ceiling
    fn reserve(&self, bytes: u64) -> Result<()> {
        let limit = self.max_size.load(Ordering::Relaxed);
        if limit == 0 {
            self.size.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        }

        let snapshot = self.snapshot_size.load(Ordering::Acquire);
        let mut current = self.size.load(Ordering::Acquire);
        loop {
            let next = current + bytes;
            if next + snapshot > limit {
                return Err(TsmError::CapacityExceeded {
                    size: next + snapshot,
                    limit,
                });
            }
            match self
                .size
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Sorted, deduplicated values of `key` across snapshot and live store.
    /// Live values win over snapshot values with the same timestamp.
    pub fn values(&self, key: &[u8]) -> Vec<Value> {
        let stores = self.stores.read();
        let snapshot = stores.snapshot.as_ref().and_then(|s| s.entry(key));
        let live = stores.live.entry(key);

        match (snapshot, live) {
            (None, None) => Vec::new(),
            (Some(e), None) | (None, Some(e)) => e.values(),
            (Some(snap), Some(live)) => {
                let mut values = snap.raw_values();
                values.extend(live.raw_values());
                deduplicate(&mut values);
                values
            }
        }
    }

    /// All keys across snapshot and live store, sorted
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let stores = self.stores.read();
        let mut keys: BTreeSet<Vec<u8>> = stores.live.keys().into_iter().collect();
        if let Some(snapshot) = &stores.snapshot {
            keys.extend(snapshot.keys());
        }
        keys.into_iter().collect()
    }

    /// Type of `key`, if it has values
    pub fn value_type(&self, key: &[u8]) -> Option<ValueType> {
        let stores = self.stores.read();
        stores
            .live
            .entry(key)
            .or_else(|| stores.snapshot.as_ref().and_then(|s| s.entry(key)))
            .map(|e| e.value_type())
    }

    /// Sort and deduplicate every live entry in place
    pub fn deduplicate(&self) {
        let stores = self.stores.read();
        let freed = stores.live.deduplicate();
        sub(&self.size, freed);
    }

    /// Move the live store aside for flushing.
    ///
    /// Fails with [`TsmError::SnapshotInProgress`] while a snapshot is out. A
    /// snapshot kept by `clear_snapshot(false)` is handed out again as is.
    pub fn snapshot(&self) -> Result<CacheSnapshot> {
        let mut stores = self.stores.write();
        if stores.snapshotting {
            return Err(TsmError::SnapshotInProgress);
        }
        stores.snapshotting = true;

        if let Some(retained) = &stores.snapshot {
            return Ok(CacheSnapshot {
                store: retained.clone(),
                shard_count: self.shard_count,
            });
        }

        let fresh = Arc::new(Store::new(self.shard_count));
        let taken = std::mem::replace(&mut stores.live, fresh);
        stores.snapshot = Some(taken.clone());

        let moved = self.size.swap(0, Ordering::AcqRel);
        self.snapshot_size.store(moved, Ordering::Release);
        self.snapshots.fetch_add(1, Ordering::Relaxed);
        self.last_snapshot_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        Ok(CacheSnapshot {
            store: taken,
            shard_count: self.shard_count,
        })
    }

    /// Finish a snapshot. On success its memory is released; otherwise it is
    /// kept for the next `snapshot()`.
    pub fn clear_snapshot(&self, success: bool) {
        let mut stores = self.stores.write();
        stores.snapshotting = false;
        if success {
            stores.snapshot = None;
            self.snapshot_size.store(0, Ordering::Release);
        }
    }

    /// Remove values in `[min, max]` from every key starting with `prefix` that
    /// matches `predicate`, in both the live and a retained snapshot store.
    pub fn delete_bucket_range(
        &self,
        prefix: &[u8],
        min: Timestamp,
        max: Timestamp,
        predicate: Option<&dyn Predicate>,
    ) {
        let stores = self.stores.read();
        let freed = stores.live.delete_prefix_range(prefix, min, max, predicate);
        sub(&self.size, freed);

        if let Some(snapshot) = &stores.snapshot {
            let freed = snapshot.delete_prefix_range(prefix, min, max, predicate);
            sub(&self.snapshot_size, freed);
        }
    }

    /// Remove values in `[min, max]` from the listed keys
    pub fn delete_range(&self, keys: &[Vec<u8>], min: Timestamp, max: Timestamp) {
        let stores = self.stores.read();
        let freed = stores.live.delete_range(keys, min, max);
        sub(&self.size, freed);

        if let Some(snapshot) = &stores.snapshot {
            let freed = snapshot.delete_range(keys, min, max);
            sub(&self.snapshot_size, freed);
        }
    }

    /// Visit every live entry, then the entries of a retained snapshot; stops
    /// at the first error. A key present in both stores is visited twice.
    pub fn apply_entry_fn<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &Entry) -> Result<()>,
    {
        let (live, snapshot) = {
            let stores = self.stores.read();
            (stores.live.clone(), stores.snapshot.clone())
        };
        for store in std::iter::once(live).chain(snapshot) {
            for (key, entry) in store.entries() {
                f(&key, &entry)?;
            }
        }
        Ok(())
    }

    /// Live plus snapshot bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire) + self.snapshot_size.load(Ordering::Acquire)
    }

    /// Bytes held by the live store only
    pub fn live_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Number of keys in the live store
    pub fn count(&self) -> usize {
        self.stores.read().live.count()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    pub fn last_write_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_write_ms.load(Ordering::Relaxed))
    }

    pub fn last_snapshot_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_snapshot_ms.load(Ordering::Relaxed))
    }

    /// Current counters
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            mem_size_bytes: self.size(),
            snapshot_bytes: self.snapshot_size.load(Ordering::Acquire),
            entries: self.count(),
            writes_ok: self.writes_ok.load(Ordering::Relaxed),
            writes_err: self.writes_err.load(Ordering::Relaxed),
            writes_dropped: self.writes_dropped.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
            last_write: self.last_write_time(),
            last_snapshot: self.last_snapshot_time(),
        }
    }

    fn touch_write(&self) {
        self.last_write_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Read-only view of a snapshot store
#[derive(Clone)]
pub struct CacheSnapshot {
    store: Arc<Store>,
    shard_count: usize,
}

impl CacheSnapshot {
    /// Sorted keys
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = self.store.keys();
        keys.sort();
        keys
    }

    /// Sorted, deduplicated values of `key`
    pub fn values(&self, key: &[u8]) -> Vec<Value> {
        self.store.entry(key).map(|e| e.values()).unwrap_or_default()
    }

    pub fn value_type(&self, key: &[u8]) -> Option<ValueType> {
        self.store.entry(key).map(|e| e.value_type())
    }

    /// Partition into at most `n` handles with disjoint keys
    pub fn split(&self, n: usize) -> Vec<CacheSnapshot> {
        let n = n.max(1);
        let mut buckets: Vec<Vec<_>> = (0..n).map(|_| Vec::new()).collect();
        let mut entries = self.store.entries();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (i, entry) in entries.into_iter().enumerate() {
            buckets[i % n].push(entry);
        }

        buckets
            .into_iter()
            .filter(|b| !b.is_empty())
            .map(|b| CacheSnapshot {
                store: Arc::new(Store::from_entries(self.shard_count, b)),
                shard_count: self.shard_count,
            })
            .collect()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.store.count()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Footprint of the snapshot store
    pub fn size(&self) -> u64 {
        self.store.size()
    }
}

fn sub(counter: &AtomicU64, n: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        Some(cur.saturating_sub(n))
    });
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::KeyEquals;
    use rand::Rng;
    use std::thread;

    fn batch(entries: &[(&str, Vec<Value>)]) -> WriteBatch {
        entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
            .collect()
    }

    fn keys_of(cache: &Cache) -> Vec<String> {
        cache
            .keys()
            .into_iter()
            .map(|k| String::from_utf8(k).unwrap())
            .collect()
    }

    #[test]
    fn test_new_cache() {
        let cache = Cache::new(100);
        assert_eq!(cache.max_size(), 100);
        assert_eq!(cache.size(), 0);
        assert!(cache.keys().is_empty());
        assert!(cache.last_write_time().is_none());
    }

    #[test]
    fn test_cache_write() {
        let values = vec![Value::new(1, 1.0), Value::new(2, 2.0), Value::new(3, 3.0)];
        let values_size = values_size(&values) as u64;
        let cache = Cache::new(3 * values_size);

        cache.write(b"foo", &values).unwrap();
        cache.write(b"bar", &values).unwrap();

        assert_eq!(cache.size(), 2 * values_size + 6);
        assert_eq!(keys_of(&cache), vec!["bar", "foo"]);
        assert!(cache.last_write_time().is_some());
    }

    #[test]
    fn test_cache_write_type_conflict() {
        let cache = Cache::new(1024);
        cache.write(b"foo", &[Value::new(1, 1.0)]).unwrap();

        let err = cache.write(b"foo", &[Value::new(2, 2i64)]).unwrap_err();
        assert!(err.is_type_conflict());
        assert_eq!(cache.values(b"foo"), vec![Value::new(1, 1.0)]);
        assert_eq!(cache.size(), 16 + 3);
    }

    #[test]
    fn test_cache_write_multi() {
        let values = vec![Value::new(1, 1.0), Value::new(2, 2.0), Value::new(3, 3.0)];
        let values_size = values_size(&values) as u64;
        let cache = Cache::new(30 * values_size);

        cache
            .write_multi(&batch(&[("foo", values.clone()), ("bar", values)]))
            .unwrap();

        assert_eq!(cache.size(), 2 * values_size + 6);
        assert_eq!(keys_of(&cache), vec!["bar", "foo"]);
    }

    #[test]
    fn test_write_multi_stats() {
        let vf = Value::new(1, 1.0);
        let vi = Value::new(1, 1i64);
        let cache = Cache::new(60);

        cache.write_multi(&batch(&[("foo", vec![vf.clone()])])).unwrap();

        let err = cache
            .write_multi(&batch(&[("foo", vec![vi]), ("bar", vec![vf.clone()])]))
            .unwrap_err();
        match err {
            TsmError::PartialWrite(p) => {
                assert_eq!(p.conflicted(), 1);
                assert_eq!(p.failed_keys().collect::<Vec<_>>(), vec![b"foo".as_slice()]);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = cache
            .write_multi(&batch(&[("foo", vec![vf.clone(), vf])]))
            .unwrap_err();
        assert!(matches!(err, TsmError::PartialWrite(ref p) if p.dropped() == 1));

        assert_eq!(cache.size(), 3 + 3 * 8 + 3 + 8);

        let stats = cache.statistics();
        assert_eq!(stats.writes_dropped, 1);
        assert_eq!(stats.writes_err, 2);
        assert_eq!(stats.writes_ok, 1);
    }

    #[test]
    fn test_write_multi_type_conflict() {
        let v0 = Value::new(1, 1.0);
        let v1 = Value::new(2, 2.0);
        let v2 = Value::new(3, 3i64);
        let cache = Cache::new(3 * 48);

        let err = cache
            .write_multi(&batch(&[("foo", vec![v0.clone()]), ("bar", vec![v1, v2])]))
            .unwrap_err();
        assert!(matches!(err, TsmError::PartialWrite(_)));

        assert_eq!(cache.size(), v0.size() as u64 + 3);
        assert_eq!(keys_of(&cache), vec!["foo"]);
    }

    #[test]
    fn test_delete_bucket_range() {
        let values = vec![Value::new(1, 1.0), Value::new(2, 2.0), Value::new(3, 3.0)];
        let values_size = values_size(&values) as u64;
        let cache = Cache::new(30 * values_size);
        cache
            .write_multi(&batch(&[("foo", values.clone()), ("bar", values)]))
            .unwrap();

        cache.delete_bucket_range(b"bar", 2, i64::MAX, None);

        assert_eq!(keys_of(&cache), vec!["bar", "foo"]);
        assert_eq!(cache.size(), values_size + 16 + 6);
        assert_eq!(cache.values(b"bar").len(), 1);
        assert_eq!(cache.values(b"foo").len(), 3);
    }

    #[test]
    fn test_delete_bucket_range_removes_emptied_keys() {
        let values = vec![Value::new(1, 1.0), Value::new(2, 2.0), Value::new(3, 3.0)];
        let cache = Cache::new(0);
        cache.write(b"foo", &values).unwrap();

        cache.delete_bucket_range(b"foo", i64::MIN, i64::MAX, None);

        assert!(cache.keys().is_empty());
        assert_eq!(cache.size(), 0);
        assert!(cache.values(b"foo").is_empty());
    }

    #[test]
    fn test_delete_bucket_range_not_sorted() {
        let values = vec![Value::new(1, 1.0), Value::new(3, 3.0), Value::new(2, 2.0)];
        let cache = Cache::new(0);
        cache.write(b"foo", &values).unwrap();

        cache.delete_bucket_range(b"foo", 1, 3, None);

        assert!(cache.keys().is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_delete_bucket_range_non_existent() {
        let cache = Cache::new(1024);
        cache.delete_bucket_range(b"bar", i64::MIN, i64::MAX, None);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_delete_bucket_range_with_predicate() {
        let values = vec![Value::new(1, 1.0), Value::new(2, 2.0), Value::new(3, 3.0)];
        let values_size = values_size(&values) as u64;
        let cache = Cache::new(30 * values_size);
        cache
            .write_multi(&batch(&[("foo", values.clone()), ("fee", values)]))
            .unwrap();

        let pred = KeyEquals::new("fee");
        cache.delete_bucket_range(b"f", 2, i64::MAX, Some(&pred));

        assert_eq!(keys_of(&cache), vec!["fee", "foo"]);
        assert_eq!(cache.size(), values_size + 16 + 6);
        assert_eq!(cache.values(b"fee").len(), 1);
        assert_eq!(cache.values(b"foo").len(), 3);
    }

    #[test]
    fn test_delete_range_reaches_retained_snapshot() {
        let cache = Cache::new(0);
        cache
            .write(b"foo", &[Value::new(1, 1.0), Value::new(2, 2.0)])
            .unwrap();
        let _snap = cache.snapshot().unwrap();
        cache.clear_snapshot(false);
        cache.write(b"foo", &[Value::new(3, 3.0)]).unwrap();

        cache.delete_range(&[b"foo".to_vec()], 2, 3);

        assert_eq!(cache.values(b"foo"), vec![Value::new(1, 1.0)]);
        assert_eq!(cache.size(), 16 + 3);
    }

    #[test]
    fn test_write_multi_duplicates() {
        let cache = Cache::new(0);
        cache
            .write_multi(&batch(&[("foo", vec![Value::new(2, 1.0), Value::new(3, 1.0)])]))
            .unwrap();
        cache
            .write_multi(&batch(&[(
                "foo",
                vec![Value::new(4, 2.0), Value::new(5, 3.0), Value::new(5, 4.0)],
            )]))
            .unwrap();

        assert_eq!(
            cache.values(b"foo"),
            vec![
                Value::new(2, 1.0),
                Value::new(3, 1.0),
                Value::new(4, 2.0),
                Value::new(5, 4.0),
            ]
        );
    }

    #[test]
    fn test_cache_values() {
        let cache = Cache::new(512);
        assert!(cache.values(b"no such key").is_empty());

        cache
            .write(
                b"foo",
                &[
                    Value::new(1, 0.0),
                    Value::new(2, 2.0),
                    Value::new(3, 3.0),
                    Value::new(1, 1.0),
                ],
            )
            .unwrap();
        cache.write(b"foo", &[Value::new(4, 4.0)]).unwrap();

        assert_eq!(
            cache.values(b"foo"),
            vec![
                Value::new(1, 1.0),
                Value::new(2, 2.0),
                Value::new(3, 3.0),
                Value::new(4, 4.0),
            ]
        );
    }

    #[test]
    fn test_cache_snapshot() {
        let v0 = Value::new(2, 0.0);
        let v1 = Value::new(3, 2.0);
        let v2 = Value::new(4, 3.0);
        let v3 = Value::new(5, 4.0);
        let v4 = Value::new(6, 5.0);
        let v5 = Value::new(1, 5.0);
        let v6 = Value::new(7, 5.0);
        let v7 = Value::new(2, 5.0);

        let cache = Cache::new(512);
        cache
            .write(b"foo", &[v0.clone(), v1.clone(), v2.clone(), v3.clone()])
            .unwrap();

        let snapshot = cache.snapshot().unwrap();
        let expected = vec![v0.clone(), v1.clone(), v2.clone(), v3.clone()];
        assert_eq!(snapshot.values(b"foo"), expected);
        assert_eq!(cache.values(b"foo"), expected);

        cache.write(b"foo", &[v4.clone()]).unwrap();
        assert_eq!(
            cache.values(b"foo"),
            vec![v0.clone(), v1.clone(), v2.clone(), v3.clone(), v4.clone()]
        );

        cache.write(b"foo", &[v5.clone()]).unwrap();
        assert_eq!(
            cache.values(b"foo"),
            vec![v5.clone(), v0, v1, v2, v3, v4.clone()]
        );

        cache.clear_snapshot(true);
        assert_eq!(cache.values(b"foo"), vec![v5.clone(), v4.clone()]);

        cache.snapshot().unwrap();
        cache.write(b"foo", &[v4.clone(), v5.clone()]).unwrap();
        cache.clear_snapshot(true);

        cache.snapshot().unwrap();
        cache.write(b"foo", &[v6.clone(), v7.clone()]).unwrap();
        assert_eq!(cache.values(b"foo"), vec![v5, v7, v4, v6]);
    }

    #[test]
    fn test_snapshot_stats() {
        let cache = Cache::new(16);
        cache
            .write_multi(&batch(&[("foo", vec![Value::new(1, 1.0)])]))
            .unwrap();
        assert_eq!(cache.size(), 16 + 3);

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot.size(), 16 + 3);
        assert_eq!(cache.size(), 16 + 3);
        assert_eq!(cache.live_size(), 0);

        let stats = cache.statistics();
        assert_eq!(stats.snapshot_bytes, 16 + 3);
        assert_eq!(stats.mem_size_bytes, 16 + 3);
        assert_eq!(stats.snapshots, 1);
        assert!(stats.last_snapshot.is_some());
    }

    #[test]
    fn test_empty_snapshot() {
        let cache = Cache::new(512);
        let snapshot = cache.snapshot().unwrap();
        assert!(snapshot.values(b"foo").is_empty());
        assert!(snapshot.is_empty());
        assert!(cache.values(b"foo").is_empty());

        cache.clear_snapshot(true);
        assert!(cache.values(b"foo").is_empty());
    }

    #[test]
    fn test_snapshot_in_progress_and_retry() {
        let cache = Cache::new(0);
        cache.write(b"foo", &[Value::new(1, 1.0)]).unwrap();

        let first = cache.snapshot().unwrap();
        assert!(matches!(cache.snapshot(), Err(TsmError::SnapshotInProgress)));

        cache.write(b"bar", &[Value::new(2, 2.0)]).unwrap();
        cache.clear_snapshot(false);

        let retry = cache.snapshot().unwrap();
        assert_eq!(retry.keys(), first.keys());
        assert_eq!(retry.keys(), vec![b"foo".to_vec()]);
        cache.clear_snapshot(true);

        assert_eq!(cache.keys(), vec![b"bar".to_vec()]);
        assert_eq!(cache.size(), 16 + 3);
    }

    #[test]
    fn test_write_memory_exceeded() {
        let v0 = Value::new(1, 1.0);
        let v1 = Value::new(2, 2.0);
        let cache = Cache::new(v1.size() as u64);

        cache.write(b"foo", &[v0]).unwrap();
        assert_eq!(keys_of(&cache), vec!["foo"]);

        let err = cache.write(b"bar", &[v1.clone()]).unwrap_err();
        assert!(err.to_string().contains("cache-max-memory-size"));

        cache.snapshot().unwrap();
        let err = cache.write(b"bar", &[v1.clone()]).unwrap_err();
        assert!(err.is_capacity_exceeded());

        cache.clear_snapshot(true);
        cache.write(b"bar", &[v1.clone()]).unwrap();
        assert_eq!(cache.values(b"bar"), vec![v1]);
    }

    #[test]
    fn test_snapshot_split() {
        let cache = Cache::new(0);
        for i in 0..10 {
            cache
                .write(format!("key{i}").as_bytes(), &[Value::new(i, i as f64)])
                .unwrap();
        }
        let snapshot = cache.snapshot().unwrap();
        let parts = snapshot.split(3);
        assert_eq!(parts.len(), 3);

        let mut all: Vec<Vec<u8>> = parts.iter().flat_map(|p| p.keys()).collect();
        all.sort();
        assert_eq!(all, snapshot.keys());
        assert_eq!(parts.iter().map(|p| p.size()).sum::<u64>(), snapshot.size());
    }

    #[test]
    fn test_apply_entry_fn() {
        let cache = Cache::new(0);
        cache.write(b"a", &[Value::new(1, 1.0)]).unwrap();
        cache.write(b"b", &[Value::new(1, 1.0), Value::new(2, 2.0)]).unwrap();

        let mut total = 0;
        cache
            .apply_entry_fn(|_, e| {
                total += e.count();
                Ok(())
            })
            .unwrap();
        assert_eq!(total, 3);

        let err = cache.apply_entry_fn(|_, _| Err(TsmError::Internal("stop".into())));
        assert!(err.is_err());
    }

    #[test]
    fn test_deduplicate_concurrent() {
        let mut rng = rand::thread_rng();
        let batch: WriteBatch = (0..200)
            .map(|i| {
                let values = (0..10)
                    .map(|j| Value::new(i + j + rng.gen_range(0..10), i as f64))
                    .collect();
                (format!("cpu{i}").into_bytes(), values)
            })
            .collect();

        let cache = Arc::new(Cache::new(0));
        let writer = {
            let cache = cache.clone();
            let batch = batch.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    cache.write_multi(&batch).unwrap();
                }
            })
        };
        let deduper = {
            let cache = cache.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    cache.deduplicate();
                }
            })
        };
        writer.join().unwrap();
        deduper.join().unwrap();

        cache.deduplicate();
        let expected: u64 = cache
            .keys()
            .iter()
            .map(|k| values_size(&cache.values(k)) as u64 + k.len() as u64)
            .sum();
        assert_eq!(cache.size(), expected);
    }
}
