//! Write-Ahead Log (WAL) implementation
//!
//! Every cache mutation is appended to the WAL before it is applied, so the
//! cache can be rebuilt after a crash. Segments are rotated before a cache
//! snapshot and removed once the snapshot is safely in a TSM file.

mod entry;
mod loader;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryType, FLAG_LZ4, RECORD_HEADER_SIZE};
pub use loader::{CacheLoader, LoadStats};
pub use reader::{parse_segment_id, segment_path, segment_paths, SegmentReader};
pub use writer::WalWriter;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// WAL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Write and replay the WAL at all
    pub enabled: bool,
    /// Directory for WAL files; the engine resolves a relative path against its data directory
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
    /// Payloads at least this large are lz4-compressed; 0 disables compression
    pub compression_threshold: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
            compression_threshold: crate::config::WAL_COMPRESSION_THRESHOLD,
        }
    }
}
