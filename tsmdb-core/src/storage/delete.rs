//! Measurement range deletes across cache, files and the series index
//!
//! A delete removes data first and index entries last. Which series lost all of
//! their data is found in two passes over a shared candidate set:
//!
//! 1. every key a file or the cache deleted from becomes a candidate
//! 2. every key still present afterwards is struck from the candidates
//!
//! Whatever is left has no data anywhere and is dropped from the tag index and
//! the series catalog. A series is only dropped when none of its field keys
//! survived.

use super::Engine;
use crate::index::{SeriesCatalog, TagIndex};
use crate::predicate::{MeasurementPredicate, Predicate};
use crate::{
    config, escape_measurement, has_measurement_prefix, series_and_field, Result, SeriesKey,
    Timestamp, TsmError, MAX_TIME, MIN_TIME,
};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of [`Engine::delete_prefix_range`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    /// Keys that lost values
    pub candidates: usize,
    /// Keys left with no values anywhere
    pub dead_keys: usize,
    /// Series removed from the index
    pub dropped_series: usize,
    /// The whole measurement was dropped from the index
    pub measurement_dropped: bool,
}

#[derive(Default)]
struct Candidates {
    keys: BTreeSet<Vec<u8>>,
    series: BTreeSet<Vec<u8>>,
}

/// Keys (and their series) that may have lost their last value
#[derive(Default)]
struct PossiblyDead {
    inner: RwLock<Candidates>,
}

impl PossiblyDead {
    fn insert(&self, key: &[u8]) {
        let (series, _) = series_and_field(key);
        let mut inner = self.inner.write();
        if !inner.keys.contains(key) {
            inner.keys.insert(key.to_vec());
        }
        if !inner.series.contains(series) {
            inner.series.insert(series.to_vec());
        }
    }

    fn is_empty(&self) -> bool {
        self.inner.read().keys.is_empty()
    }

    fn len(&self) -> usize {
        self.inner.read().keys.len()
    }

    /// Strike every present key, and its series, from the candidates.
    ///
    /// The read lock is yielded every few keys so concurrent scans (and the
    /// writers among them) make progress.
    fn prune_present(&self, present: impl IntoIterator<Item = Vec<u8>>) {
        let mut guard = self.inner.read();
        for (i, key) in present.into_iter().enumerate() {
            if i > 0 && i % config::DELETE_SCAN_YIELD_EVERY == 0 {
                RwLockReadGuard::bump(&mut guard);
            }

            let (series, _) = series_and_field(&key);
            if !guard.keys.contains(&key) && !guard.series.contains(series) {
                continue;
            }

            drop(guard);
            {
                let mut inner = self.inner.write();
                inner.keys.remove(&key);
                inner.series.remove(series);
            }
            guard = self.inner.read();
        }
    }

    fn into_inner(self) -> Candidates {
        self.inner.into_inner()
    }
}

/// Re-enables tag index compactions on drop
struct IndexCompactionsDisabled<'a>(&'a dyn TagIndex);

impl<'a> IndexCompactionsDisabled<'a> {
    fn new(index: &'a dyn TagIndex) -> Self {
        index.disable_compactions();
        index.wait();
        Self(index)
    }
}

impl Drop for IndexCompactionsDisabled<'_> {
    fn drop(&mut self) {
        self.0.enable_compactions();
    }
}

/// Re-enables series catalog compactions on drop
struct CatalogCompactionsDisabled<'a>(&'a dyn SeriesCatalog);

impl<'a> CatalogCompactionsDisabled<'a> {
    fn new(catalog: &'a dyn SeriesCatalog) -> Self {
        catalog.disable_compactions();
        Self(catalog)
    }
}

impl Drop for CatalogCompactionsDisabled<'_> {
    fn drop(&mut self) {
        self.0.enable_compactions();
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(TsmError::Cancelled);
    }
    Ok(())
}

impl Engine {
    /// Delete the values of measurement `name` in `[min, max]` from the cache
    /// and every file, optionally only for keys matching `predicate`, then
    /// drop every series left without data from the tag index and catalog.
    ///
    /// Deletes run one at a time. Snapshot flushes and all compactions are
    /// held off while one runs; writes are not.
    pub fn delete_prefix_range(
        &self,
        name: &str,
        min: Timestamp,
        max: Timestamp,
        predicate: Option<&dyn Predicate>,
        cancel: &CancellationToken,
    ) -> Result<DeleteSummary> {
        self.check_open()?;
        let _delete = self.delete_lock.lock();
        let start = Instant::now();

        let prefix = escape_measurement(name);
        let wire = match (&self.wal, predicate) {
            (Some(_), Some(p)) => Some(p.marshal()?),
            _ => None,
        };

        let _index_guard = IndexCompactionsDisabled::new(self.index.as_ref());
        let _level_guard = self.compactor.disable();
        let _catalog_guard = CatalogCompactionsDisabled::new(self.catalog.as_ref());
        let _flush = self.flush_lock.lock();

        check_cancelled(cancel)?;
        if let Some(wal) = &self.wal {
            wal.delete_bucket_range(&prefix, min, max, wire)?;
        }

        let scope = MeasurementPredicate::new(&prefix, predicate);
        let dead = PossiblyDead::default();

        self.file_store.apply(|file| {
            file.delete_prefix(&prefix, min, max, Some(&scope), &|key: &[u8]| dead.insert(key))
        })?;

        self.cache.apply_entry_fn(|key, _| {
            if scope.matches(key) {
                dead.insert(key);
            }
            Ok(())
        })?;
        self.cache.delete_bucket_range(&prefix, min, max, Some(&scope));

        let mut summary = DeleteSummary {
            candidates: dead.len(),
            ..Default::default()
        };
        if dead.is_empty() {
            debug!(measurement = name, "delete matched no data");
            return Ok(summary);
        }

        self.file_store.apply(|file| {
            let present = file
                .iterator(&prefix)?
                .filter(|key| has_measurement_prefix(key, &prefix));
            dead.prune_present(present);
            Ok(())
        })?;

        let mut present = Vec::new();
        self.cache.apply_entry_fn(|key, entry| {
            if !entry.is_empty() && has_measurement_prefix(key, &prefix) {
                present.push(key.to_vec());
            }
            Ok(())
        })?;
        dead.prune_present(present);

        let Candidates { keys, series } = dead.into_inner();
        summary.dead_keys = keys.len();
        if !series.is_empty() {
            check_cancelled(cancel)?;
            let full_drop = min == MIN_TIME && max == MAX_TIME && predicate.is_none();
            let (dropped, measurement_dropped) =
                self.drop_dead_series(name, &prefix, full_drop, &series, cancel)?;
            summary.dropped_series = dropped;
            summary.measurement_dropped = measurement_dropped;
        }

        info!(
            measurement = name,
            min,
            max,
            predicate = predicate.is_some(),
            candidates = summary.candidates,
            dead_keys = summary.dead_keys,
            dropped_series = summary.dropped_series,
            measurement_dropped = summary.measurement_dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "measurement range deleted"
        );
        Ok(summary)
    }

    /// Delete every value of measurement `name`
    pub fn delete_measurement(&self, name: &str, cancel: &CancellationToken) -> Result<DeleteSummary> {
        self.delete_prefix_range(name, MIN_TIME, MAX_TIME, None, cancel)
    }

    /// Remove dead series from the tag index, then from the catalog.
    ///
    /// Returns the number of series dropped and whether the whole measurement
    /// went with them.
    fn drop_dead_series(
        &self,
        name: &str,
        prefix: &[u8],
        full_drop: bool,
        series: &BTreeSet<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<(usize, bool)> {
        if full_drop && !self.has_surviving_series(prefix) {
            let ids = self.index.measurement_series_ids(name)?;
            self.index.drop_measurement(name)?;
            for id in &ids {
                self.catalog.delete_series_id(*id)?;
            }
            return Ok((ids.len(), true));
        }

        let mut dropped = 0;
        for raw in series {
            check_cancelled(cancel)?;

            let key = match SeriesKey::parse(raw) {
                Ok(key) => key,
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(raw),
                        error = %e,
                        "cannot drop unparseable series"
                    );
                    continue;
                }
            };
            let id = self.catalog.series_id(&key);
            if id.is_none() {
                continue;
            }
            self.index.drop_series(id, &key, true)?;
            self.catalog.delete_series_id(id)?;
            dropped += 1;
        }
        Ok((dropped, false))
    }

    /// Any key of the measurement still has data
    fn has_surviving_series(&self, prefix: &[u8]) -> bool {
        let in_cache = self
            .cache
            .keys()
            .iter()
            .any(|key| has_measurement_prefix(key, prefix));
        in_cache
            || self.file_store.files().iter().any(|file| {
                file.iterator(prefix)
                    .map(|mut keys| keys.any(|key| has_measurement_prefix(&key, prefix)))
                    .unwrap_or(true)
            })
    }
}
