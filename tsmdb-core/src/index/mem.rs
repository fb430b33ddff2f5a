//! In-memory tag index

use super::{SeriesId, TagIndex};
use crate::{Result, SeriesKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Default)]
struct Measurement {
    series: BTreeMap<SeriesId, SeriesKey>,
    /// tag key -> tag value -> series
    tags: BTreeMap<String, BTreeMap<String, BTreeSet<SeriesId>>>,
}

impl Measurement {
    fn remove_postings(&mut self, id: SeriesId, key: &SeriesKey) {
        for (k, v) in &key.tags {
            if let Some(ids) = self.tags.get_mut(k).and_then(|values| values.get_mut(v)) {
                ids.remove(&id);
            }
        }
    }

    /// Drop empty posting lists; returns how many were removed
    fn prune(&mut self) -> usize {
        let mut pruned = 0;
        self.tags.retain(|_, values| {
            let before = values.len();
            values.retain(|_, ids| !ids.is_empty());
            pruned += before - values.len();
            !values.is_empty()
        });
        pruned
    }
}

/// Tag index held entirely in memory.
///
/// Dropping a series leaves empty posting lists behind; [`TagIndex::compact`]
/// reclaims them along with measurements that have no series left.
pub struct MemIndex {
    measurements: RwLock<BTreeMap<String, Measurement>>,
    compactions_disabled: AtomicUsize,
    compacting: Mutex<()>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self {
            measurements: RwLock::new(BTreeMap::new()),
            compactions_disabled: AtomicUsize::new(0),
            compacting: Mutex::new(()),
        }
    }

    /// Series ids whose `tag` equals `value`
    pub fn tag_value_series_ids(&self, name: &str, tag: &str, value: &str) -> Vec<SeriesId> {
        self.measurements
            .read()
            .get(name)
            .and_then(|m| m.tags.get(tag))
            .and_then(|values| values.get(value))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Values of `tag` that still have series
    pub fn tag_values(&self, name: &str, tag: &str) -> Vec<String> {
        self.measurements
            .read()
            .get(name)
            .and_then(|m| m.tags.get(tag))
            .map(|values| {
                values
                    .iter()
                    .filter(|(_, ids)| !ids.is_empty())
                    .map(|(v, _)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn compactions_enabled(&self) -> bool {
        self.compactions_disabled.load(Ordering::SeqCst) == 0
    }
}

impl Default for MemIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TagIndex for MemIndex {
    fn create_series_if_not_exists(&self, id: SeriesId, key: &SeriesKey) -> Result<()> {
        let mut measurements = self.measurements.write();
        let m = measurements.entry(key.measurement.clone()).or_default();
        if m.series.contains_key(&id) {
            return Ok(());
        }
        for (k, v) in &key.tags {
            m.tags
                .entry(k.clone())
                .or_default()
                .entry(v.clone())
                .or_default()
                .insert(id);
        }
        m.series.insert(id, key.clone());
        Ok(())
    }

    fn drop_measurement(&self, name: &str) -> Result<()> {
        if let Some(m) = self.measurements.write().remove(name) {
            debug!(measurement = name, series = m.series.len(), "measurement dropped from index");
        }
        Ok(())
    }

    fn drop_series(&self, id: SeriesId, key: &SeriesKey, cascade: bool) -> Result<()> {
        let mut measurements = self.measurements.write();
        let Some(m) = measurements.get_mut(&key.measurement) else {
            return Ok(());
        };
        if m.series.remove(&id).is_none() {
            return Ok(());
        }
        m.remove_postings(id, key);

        if cascade && m.series.is_empty() {
            measurements.remove(&key.measurement);
            debug!(measurement = %key.measurement, "last series dropped, measurement removed");
        }
        Ok(())
    }

    fn measurement_series_ids(&self, name: &str) -> Result<Vec<SeriesId>> {
        Ok(self
            .measurements
            .read()
            .get(name)
            .map(|m| m.series.keys().copied().collect())
            .unwrap_or_default())
    }

    fn has_measurement(&self, name: &str) -> bool {
        self.measurements
            .read()
            .get(name)
            .is_some_and(|m| !m.series.is_empty())
    }

    fn measurement_names(&self) -> Vec<String> {
        self.measurements
            .read()
            .iter()
            .filter(|(_, m)| !m.series.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn series_cardinality(&self) -> u64 {
        self.measurements
            .read()
            .values()
            .map(|m| m.series.len() as u64)
            .sum()
    }

    fn measurement_cardinality(&self) -> u64 {
        self.measurements
            .read()
            .values()
            .filter(|m| !m.series.is_empty())
            .count() as u64
    }

    fn disable_compactions(&self) {
        self.compactions_disabled.fetch_add(1, Ordering::SeqCst);
    }

    fn enable_compactions(&self) {
        let _ = self
            .compactions_disabled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn wait(&self) {
        drop(self.compacting.lock());
    }

    fn compact(&self) -> Result<usize> {
        let _compacting = self.compacting.lock();
        if !self.compactions_enabled() {
            return Ok(0);
        }

        let mut measurements = self.measurements.write();
        let mut reclaimed = 0;
        measurements.retain(|_, m| {
            reclaimed += m.prune();
            if m.series.is_empty() {
                reclaimed += 1;
                false
            } else {
                true
            }
        });

        if reclaimed > 0 {
            debug!(reclaimed, "tag index compacted");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(host: &str) -> SeriesKey {
        SeriesKey::new("cpu").with_tag("host", host).with_tag("region", "west")
    }

    fn populated() -> MemIndex {
        let index = MemIndex::new();
        index.create_series_if_not_exists(SeriesId(1), &cpu("a")).unwrap();
        index.create_series_if_not_exists(SeriesId(2), &cpu("b")).unwrap();
        index
            .create_series_if_not_exists(SeriesId(3), &SeriesKey::new("mem").with_tag("host", "a"))
            .unwrap();
        index
    }

    #[test]
    fn test_create_is_idempotent() {
        let index = populated();
        index.create_series_if_not_exists(SeriesId(1), &cpu("a")).unwrap();

        assert_eq!(index.series_cardinality(), 3);
        assert_eq!(index.measurement_cardinality(), 2);
        assert_eq!(index.measurement_names(), vec!["cpu", "mem"]);
        assert_eq!(
            index.tag_value_series_ids("cpu", "region", "west"),
            vec![SeriesId(1), SeriesId(2)]
        );
    }

    #[test]
    fn test_drop_measurement() {
        let index = populated();
        index.drop_measurement("cpu").unwrap();

        assert!(!index.has_measurement("cpu"));
        assert!(index.measurement_series_ids("cpu").unwrap().is_empty());
        assert_eq!(index.measurement_series_ids("mem").unwrap(), vec![SeriesId(3)]);
        index.drop_measurement("cpu").unwrap();
    }

    #[test]
    fn test_drop_series_cascade() {
        let index = populated();
        index.drop_series(SeriesId(1), &cpu("a"), true).unwrap();
        assert!(index.has_measurement("cpu"));
        assert_eq!(index.tag_values("cpu", "host"), vec!["b"]);

        index.drop_series(SeriesId(2), &cpu("b"), true).unwrap();
        assert!(!index.has_measurement("cpu"));
        assert_eq!(index.measurement_cardinality(), 1);
    }

    #[test]
    fn test_compact_reclaims_empty_postings() {
        let index = populated();
        index.drop_series(SeriesId(1), &cpu("a"), false).unwrap();
        index.drop_series(SeriesId(2), &cpu("b"), false).unwrap();
        assert_eq!(index.measurement_cardinality(), 1);

        index.disable_compactions();
        assert_eq!(index.compact().unwrap(), 0);
        index.enable_compactions();

        // host=a, host=b, region=west postings plus the measurement itself
        assert_eq!(index.compact().unwrap(), 4);
        assert_eq!(index.compact().unwrap(), 0);
        assert_eq!(index.measurement_names(), vec!["mem"]);
    }

    #[test]
    fn test_enable_does_not_underflow() {
        let index = MemIndex::new();
        index.enable_compactions();
        assert!(index.compactions_enabled());
        index.disable_compactions();
        index.disable_compactions();
        index.enable_compactions();
        assert!(!index.compactions_enabled());
        index.wait();
    }
}
