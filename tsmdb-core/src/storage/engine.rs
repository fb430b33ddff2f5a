//! Storage engine - top-level coordinator

use super::EngineConfig;
use crate::cache::{self, Cache, CacheStatistics, Value, WriteBatch};
use crate::compaction::LevelCompactor;
use crate::index::{MemIndex, SeriesCatalog, SeriesFile, TagIndex};
use crate::tsm::FileStore;
use crate::wal::{segment_paths, CacheLoader, LoadStats, WalWriter};
use crate::{composite_key, series_and_field, Point, Result, SeriesKey, TsmError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// tsmdb storage engine
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) cache: Arc<Cache>,
    pub(super) wal: Option<WalWriter>,
    pub(super) file_store: Arc<FileStore>,
    pub(super) compactor: LevelCompactor,
    pub(super) index: Arc<dyn TagIndex>,
    pub(super) catalog: Arc<dyn SeriesCatalog>,

    /// Held shared by writers across "WAL append + cache write" and exclusively
    /// while the WAL segment is closed and the cache snapshotted
    write_gate: RwLock<()>,
    /// Serializes snapshot flushes; deletes hold it for their whole run
    pub(super) flush_lock: Mutex<()>,
    /// WAL segment bounding an outstanding snapshot
    snapshot_segment: Mutex<Option<u64>>,
    /// Serializes deletes
    pub(super) delete_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Engine {
    /// Open the engine with the in-memory tag index and series file
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(
            config,
            Arc::new(MemIndex::new()),
            Arc::new(SeriesFile::new()),
        )
    }

    /// Open the engine with the given index collaborators.
    ///
    /// Existing TSM files are opened, the WAL is replayed into the cache and
    /// every series found in either is registered with the index.
    pub fn open_with(
        config: EngineConfig,
        index: Arc<dyn TagIndex>,
        catalog: Arc<dyn SeriesCatalog>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let start = Instant::now();

        let file_store = Arc::new(FileStore::open(config.tsm_dir(), config.compress_files)?);
        let cache = Arc::new(Cache::from_config(&config.cache));

        let wal = if config.wal.enabled {
            let wal_config = config.wal_config();
            std::fs::create_dir_all(&wal_config.dir)?;
            let segments = segment_paths(&wal_config.dir)?;
            let stats: LoadStats = CacheLoader::new(segments).load(&cache)?;
            if stats.truncated > 0 || stats.conflicts > 0 {
                warn!(
                    truncated = stats.truncated,
                    conflicts = stats.conflicts,
                    "WAL replay recovered from damaged or conflicting records"
                );
            }
            Some(WalWriter::new(wal_config)?)
        } else {
            None
        };

        let compactor = LevelCompactor::new(config.compaction.clone(), file_store.clone());

        let engine = Self {
            config,
            cache,
            wal,
            file_store,
            compactor,
            index,
            catalog,
            write_gate: RwLock::new(()),
            flush_lock: Mutex::new(()),
            snapshot_segment: Mutex::new(None),
            delete_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        let series = engine.rebuild_index()?;
        info!(
            data_dir = ?engine.config.data_dir,
            files = engine.file_store.count(),
            cache_bytes = engine.cache.size(),
            series,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "engine opened"
        );

        Ok(engine)
    }

    /// Register every series that has data in a file or the cache
    fn rebuild_index(&self) -> Result<usize> {
        let mut series: BTreeSet<Vec<u8>> = BTreeSet::new();
        for key in self.file_store.keys().into_iter().chain(self.cache.keys()) {
            let (s, _) = series_and_field(&key);
            series.insert(s.to_vec());
        }

        for raw in &series {
            match SeriesKey::parse(raw) {
                Ok(key) => self.create_series(&key)?,
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(raw),
                    error = %e,
                    "skipping unparseable series key"
                ),
            }
        }
        Ok(series.len())
    }

    fn create_series(&self, key: &SeriesKey) -> Result<()> {
        let id = self.catalog.create_series_if_not_exists(key)?;
        self.index.create_series_if_not_exists(id, key)
    }

    pub(super) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TsmError::EngineClosed);
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn file_store(&self) -> &Arc<FileStore> {
        &self.file_store
    }

    pub fn compactor(&self) -> &LevelCompactor {
        &self.compactor
    }

    pub fn index(&self) -> &Arc<dyn TagIndex> {
        &self.index
    }

    pub fn catalog(&self) -> &Arc<dyn SeriesCatalog> {
        &self.catalog
    }

    /// Write points.
    ///
    /// Every point is validated before anything is written. Series are
    /// registered first; the batch is then applied to the cache and the keys
    /// the cache accepted are logged. Per-key cache failures come back as
    /// [`TsmError::PartialWrite`].
    pub fn write_points(&self, points: &[Point]) -> Result<()> {
        self.check_open()?;
        if points.is_empty() {
            return Ok(());
        }
        for point in points {
            point.validate()?;
        }

        let mut batch = WriteBatch::new();
        let mut series: BTreeMap<Vec<u8>, &SeriesKey> = BTreeMap::new();
        for point in points {
            let encoded = point.key.encode();
            for (field, value) in point.data.fields.iter() {
                batch
                    .entry(composite_key(&encoded, field))
                    .or_default()
                    .push(Value::new(point.data.timestamp, value.clone()));
            }
            series.entry(encoded).or_insert(&point.key);
        }

        for key in series.values() {
            self.create_series(key)?;
        }

        let _gate = self.write_gate.read();
        let written = self.cache.write_multi(&batch);
        if let Some(wal) = &self.wal {
            // Rejected keys must not reappear on replay.
            if let Err(TsmError::PartialWrite(partial)) = &written {
                for key in partial.failed_keys() {
                    batch.remove(key);
                }
            }
            if !batch.is_empty() {
                wal.write_multi(&batch)?;
            }
        }
        written
    }

    /// Values of `key` across files and cache, sorted; the cache wins on
    /// equal timestamps
    pub fn values(&self, key: &[u8]) -> Result<Vec<Value>> {
        let mut values = self.file_store.read(key)?;
        values.extend(self.cache.values(key));
        cache::deduplicate(&mut values);
        Ok(values)
    }

    /// Every key with data, sorted
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys: BTreeSet<Vec<u8>> = self.file_store.keys().into_iter().collect();
        keys.extend(self.cache.keys());
        keys.into_iter().collect()
    }

    /// The cache is large enough to flush
    pub fn should_snapshot(&self) -> bool {
        let threshold = self.config.cache.snapshot_memory_size;
        threshold > 0 && self.cache.size() >= threshold
    }

    /// Flush the cache to a new TSM file.
    ///
    /// Returns false if the cache was empty. On failure the snapshot is kept in
    /// the cache and retried by the next call; WAL segments are only removed
    /// once the file is in place.
    pub fn write_snapshot(&self) -> Result<bool> {
        let _flush = self.flush_lock.lock();
        let start = Instant::now();

        let (snapshot, segment) = {
            let _gate = self.write_gate.write();
            let mut pending = self.snapshot_segment.lock();
            let segment = match (*pending, &self.wal) {
                (Some(segment), _) => Some(segment),
                (None, Some(wal)) => Some(wal.close_segment()?),
                (None, None) => None,
            };
            let snapshot = self.cache.snapshot()?;
            *pending = segment;
            (snapshot, segment)
        };

        let entries: Vec<(Vec<u8>, Vec<Value>)> = snapshot
            .keys()
            .into_iter()
            .filter_map(|key| {
                let values = snapshot.values(&key);
                (!values.is_empty()).then_some((key, values))
            })
            .collect();

        let written = if entries.is_empty() {
            None
        } else {
            match self.file_store.write_file(&entries) {
                Ok(file) => Some(file),
                Err(e) => {
                    self.cache.clear_snapshot(false);
                    warn!(error = %e, "snapshot flush failed, keeping snapshot for retry");
                    return Err(e);
                }
            }
        };

        let generation = written.as_ref().map(|f| f.generation());
        if let Some(file) = written {
            self.file_store.add(file);
        }
        self.cache.clear_snapshot(true);
        *self.snapshot_segment.lock() = None;

        if let (Some(wal), Some(segment)) = (&self.wal, segment) {
            wal.truncate_before(segment)?;
        }

        if let Some(generation) = generation {
            info!(
                generation,
                keys = entries.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "cache snapshot written"
            );
        }
        Ok(generation.is_some())
    }

    /// Run one level compaction if one is due
    pub fn compact(&self) -> Result<bool> {
        self.check_open()?;
        self.compactor.compact_level()
    }

    /// One round of background work: flush, level compaction, index compaction
    pub fn run_maintenance(&self) -> Result<()> {
        self.check_open()?;
        if self.should_snapshot() {
            self.write_snapshot()?;
        }
        while self.compactor.compact_level()? {}
        self.index.compact()?;
        self.catalog.compact()?;
        Ok(())
    }

    /// Run [`Engine::run_maintenance`] every `check_interval_ms` until `cancel`
    /// fires or the engine is closed
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = Duration::from_millis(engine.config.compaction.check_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if engine.closed.load(Ordering::Acquire) {
                    break;
                }

                let worker = Arc::clone(&engine);
                match tokio::task::spawn_blocking(move || worker.run_maintenance()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(TsmError::EngineClosed)) => break,
                    Ok(Err(e)) if e.is_retryable() => {
                        debug!(error = %e, "background maintenance deferred")
                    }
                    Ok(Err(e)) => warn!(error = %e, "background maintenance failed"),
                    Err(e) => warn!(error = %e, "background maintenance task panicked"),
                }
            }
            debug!("background maintenance stopped");
        })
    }

    pub fn series_cardinality(&self) -> u64 {
        self.index.series_cardinality()
    }

    pub fn measurement_cardinality(&self) -> u64 {
        self.index.measurement_cardinality()
    }

    /// Flush the cache and stop accepting operations
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _delete = self.delete_lock.lock();
        self.write_snapshot()?;
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        info!(data_dir = ?self.config.data_dir, "engine closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.statistics(),
            file_count: self.file_store.count(),
            file_bytes: self.file_store.size(),
            series: self.index.series_cardinality(),
            measurements: self.index.measurement_cardinality(),
            compactions: self.compactor.completed(),
        }
    }
}

/// Storage engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache: CacheStatistics,
    pub file_count: usize,
    pub file_bytes: u64,
    pub series: u64,
    pub measurements: u64,
    pub compactions: u64,
}
