//! Series catalog backed by concurrent skip lists

use super::{SeriesCatalog, SeriesId};
use crate::{Result, SeriesKey};
use crossbeam_skiplist::{SkipMap, SkipSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Assigns monotonically increasing ids to series keys.
///
/// Deleting an id only tombstones it; lookups skip tombstoned ids and a series
/// created again after a delete gets a fresh id. [`SeriesCatalog::compact`]
/// purges tombstoned entries.
pub struct SeriesFile {
    ids: SkipMap<Vec<u8>, u64>,
    keys: SkipMap<u64, SeriesKey>,
    tombstones: SkipSet<u64>,
    next_id: AtomicU64,
    create: Mutex<()>,
    compactions_disabled: AtomicUsize,
}

impl SeriesFile {
    pub fn new() -> Self {
        Self {
            ids: SkipMap::new(),
            keys: SkipMap::new(),
            tombstones: SkipSet::new(),
            next_id: AtomicU64::new(1),
            create: Mutex::new(()),
            compactions_disabled: AtomicUsize::new(0),
        }
    }

    fn live_id(&self, encoded: &[u8]) -> Option<u64> {
        self.ids
            .get(encoded)
            .map(|e| *e.value())
            .filter(|id| !self.tombstones.contains(id))
    }

    pub fn compactions_enabled(&self) -> bool {
        self.compactions_disabled.load(Ordering::SeqCst) == 0
    }

    /// Number of tombstoned ids not yet purged
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}

impl Default for SeriesFile {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesCatalog for SeriesFile {
    fn create_series_if_not_exists(&self, key: &SeriesKey) -> Result<SeriesId> {
        let encoded = key.encode();
        if let Some(id) = self.live_id(&encoded) {
            return Ok(SeriesId(id));
        }

        let _create = self.create.lock();
        if let Some(id) = self.live_id(&encoded) {
            return Ok(SeriesId(id));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.keys.insert(id, key.clone());
        self.ids.insert(encoded, id);
        Ok(SeriesId(id))
    }

    fn series_id(&self, key: &SeriesKey) -> SeriesId {
        self.live_id(&key.encode()).map(SeriesId).unwrap_or(SeriesId::NONE)
    }

    fn series_key(&self, id: SeriesId) -> Option<SeriesKey> {
        if self.tombstones.contains(&id.0) {
            return None;
        }
        self.keys.get(&id.0).map(|e| e.value().clone())
    }

    fn delete_series_id(&self, id: SeriesId) -> Result<()> {
        if !id.is_none() && self.keys.contains_key(&id.0) {
            self.tombstones.insert(id.0);
        }
        Ok(())
    }

    fn is_deleted(&self, id: SeriesId) -> bool {
        self.tombstones.contains(&id.0)
    }

    fn series_count(&self) -> u64 {
        self.keys.len().saturating_sub(self.tombstones.len()) as u64
    }

    fn disable_compactions(&self) {
        self.compactions_disabled.fetch_add(1, Ordering::SeqCst);
    }

    fn enable_compactions(&self) {
        let _ = self
            .compactions_disabled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn compact(&self) -> Result<usize> {
        let _create = self.create.lock();
        if !self.compactions_enabled() {
            return Ok(0);
        }

        let mut purged = 0;
        for id in self.tombstones.iter() {
            let id = *id.value();
            if let Some(entry) = self.keys.remove(&id) {
                let encoded = entry.value().encode();
                // The key may have been re-created under a newer id.
                if self.ids.get(&encoded).is_some_and(|e| *e.value() == id) {
                    self.ids.remove(&encoded);
                }
            }
            self.tombstones.remove(&id);
            purged += 1;
        }

        if purged > 0 {
            debug!(purged, "series file compacted");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str) -> SeriesKey {
        SeriesKey::new("cpu").with_tag("host", host)
    }

    #[test]
    fn test_create_assigns_stable_ids() {
        let sfile = SeriesFile::new();
        let a = sfile.create_series_if_not_exists(&key("a")).unwrap();
        let b = sfile.create_series_if_not_exists(&key("b")).unwrap();

        assert_ne!(a, b);
        assert!(!a.is_none());
        assert_eq!(sfile.create_series_if_not_exists(&key("a")).unwrap(), a);
        assert_eq!(sfile.series_id(&key("a")), a);
        assert_eq!(sfile.series_key(b), Some(key("b")));
        assert_eq!(sfile.series_id(&key("zzz")), SeriesId::NONE);
        assert_eq!(sfile.series_count(), 2);
    }

    #[test]
    fn test_delete_and_recreate() {
        let sfile = SeriesFile::new();
        let a = sfile.create_series_if_not_exists(&key("a")).unwrap();
        sfile.delete_series_id(a).unwrap();

        assert!(sfile.is_deleted(a));
        assert_eq!(sfile.series_id(&key("a")), SeriesId::NONE);
        assert_eq!(sfile.series_key(a), None);
        assert_eq!(sfile.series_count(), 0);

        let again = sfile.create_series_if_not_exists(&key("a")).unwrap();
        assert_ne!(again, a);
        assert_eq!(sfile.series_id(&key("a")), again);

        assert_eq!(sfile.compact().unwrap(), 1);
        assert_eq!(sfile.series_id(&key("a")), again);
        assert_eq!(sfile.series_count(), 1);
    }

    #[test]
    fn test_compaction_gate() {
        let sfile = SeriesFile::new();
        let a = sfile.create_series_if_not_exists(&key("a")).unwrap();
        sfile.delete_series_id(a).unwrap();
        sfile.delete_series_id(SeriesId::NONE).unwrap();

        sfile.disable_compactions();
        assert_eq!(sfile.compact().unwrap(), 0);
        assert_eq!(sfile.tombstone_count(), 1);
        sfile.enable_compactions();

        assert_eq!(sfile.compact().unwrap(), 1);
        assert_eq!(sfile.tombstone_count(), 0);
    }

    #[test]
    fn test_concurrent_create() {
        let sfile = SeriesFile::new();
        let ids: Vec<SeriesId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| sfile.create_series_if_not_exists(&key("shared")).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(sfile.series_count(), 1);
    }
}
