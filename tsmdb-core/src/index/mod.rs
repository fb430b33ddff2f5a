//! Series index
//!
//! Two collaborators keep track of which series exist:
//!
//! - the **tag index** maps measurements and tag pairs to series ids
//! - the **series catalog** assigns ids to series keys
//!
//! Both are traits so the engine can run against other implementations; the
//! in-memory [`MemIndex`] and [`SeriesFile`] are rebuilt from data on open.

mod mem;
mod series_file;

pub use mem::MemIndex;
pub use series_file::SeriesFile;

use crate::{Result, SeriesKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a series; zero means "no series"
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SeriesId(pub u64);

impl SeriesId {
    pub const NONE: SeriesId = SeriesId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inverted index from measurements and tags to series
pub trait TagIndex: Send + Sync {
    fn create_series_if_not_exists(&self, id: SeriesId, key: &SeriesKey) -> Result<()>;

    /// Remove a measurement and every series under it
    fn drop_measurement(&self, name: &str) -> Result<()>;

    /// Remove one series. With `cascade`, a measurement left without series is
    /// removed as well.
    fn drop_series(&self, id: SeriesId, key: &SeriesKey, cascade: bool) -> Result<()>;

    /// Ids of every series of a measurement, sorted
    fn measurement_series_ids(&self, name: &str) -> Result<Vec<SeriesId>>;

    fn has_measurement(&self, name: &str) -> bool;

    /// Sorted measurement names
    fn measurement_names(&self) -> Vec<String>;

    fn series_cardinality(&self) -> u64;

    fn measurement_cardinality(&self) -> u64;

    /// Stop compactions from starting. Calls nest.
    fn disable_compactions(&self);

    fn enable_compactions(&self);

    /// Block until no compaction is running
    fn wait(&self);

    /// Compact if enabled; returns the number of entries reclaimed
    fn compact(&self) -> Result<usize>;
}

/// Assigns stable ids to series keys
pub trait SeriesCatalog: Send + Sync {
    fn create_series_if_not_exists(&self, key: &SeriesKey) -> Result<SeriesId>;

    /// Id of a live series, or [`SeriesId::NONE`]
    fn series_id(&self, key: &SeriesKey) -> SeriesId;

    fn series_key(&self, id: SeriesId) -> Option<SeriesKey>;

    /// Mark a series id deleted
    fn delete_series_id(&self, id: SeriesId) -> Result<()>;

    fn is_deleted(&self, id: SeriesId) -> bool;

    fn series_count(&self) -> u64;

    /// Stop compactions from starting. Calls nest.
    fn disable_compactions(&self);

    fn enable_compactions(&self);

    /// Compact if enabled; returns the number of entries reclaimed
    fn compact(&self) -> Result<usize>;
}
