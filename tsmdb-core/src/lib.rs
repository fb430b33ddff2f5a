//! tsmdb Core - Time-Series Storage Engine
//!
//! The write path of a TSM-style time-series store:
//!
//! - **Cache**: sharded in-memory buffer absorbing every write, with a memory
//!   ceiling and a snapshot protocol for flushing to disk
//! - **WAL (Write-Ahead Log)**: durability for the cache, replayed on open with
//!   tolerance for a torn tail
//! - **TSM files**: immutable sorted files written from cache snapshots, deleted
//!   from through tombstones
//! - **Compaction**: level compaction merging TSM files in the background
//! - **Index**: tag index and series catalog kept consistent with the data
//!
//! # Deletes
//!
//! [`storage::Engine::delete_prefix_range`] removes a measurement's data in a time
//! range (optionally filtered by a [`predicate::Predicate`]) from the cache and every
//! file, then drops the series that no longer have any data from the index.

pub mod cache;
pub mod compaction;
pub mod index;
pub mod predicate;
pub mod storage;
pub mod tsm;
pub mod wal;

mod error;
mod types;

pub use error::{PartialWriteError, Result, TsmError, WriteFailure};
pub use types::*;

/// tsmdb version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Cache memory ceiling (1GB)
    pub const DEFAULT_CACHE_MAX_MEMORY_SIZE: u64 = 1024 * 1024 * 1024;

    /// Cache size that triggers a snapshot flush (25MB)
    pub const DEFAULT_CACHE_SNAPSHOT_MEMORY_SIZE: u64 = 25 * 1024 * 1024;

    /// Number of shards in a cache store
    pub const STORE_SHARD_COUNT: usize = 16;

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// WAL payloads at least this large are lz4-compressed
    pub const WAL_COMPRESSION_THRESHOLD: usize = 4 * 1024;

    /// Number of TSM files that triggers a level compaction
    pub const LEVEL_COMPACTION_TRIGGER: usize = 4;

    /// Interval of the background snapshot/compaction loop (1s)
    pub const COMPACTION_CHECK_INTERVAL_MS: u64 = 1000;

    /// Keys scanned between yields of the possibly-dead set lock
    pub const DELETE_SCAN_YIELD_EVERY: usize = 1024;
}
