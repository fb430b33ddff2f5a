//! Storage engine - coordinates cache, WAL, TSM files and the series index

mod delete;
mod engine;

pub use delete::DeleteSummary;
pub use engine::{Engine, EngineStats};

use crate::cache::CacheConfig;
use crate::compaction::CompactionConfig;
use crate::wal::WalConfig;
use crate::{Result, TsmError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data directory; TSM files live in `<data_dir>/tsm`
    pub data_dir: PathBuf,
    /// WAL configuration
    pub wal: WalConfig,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Level compaction configuration
    pub compaction: CompactionConfig,
    /// Compress TSM file bodies with lz4
    pub compress_files: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("data")
    }
}

impl EngineConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            wal: WalConfig::default(),
            cache: CacheConfig::default(),
            compaction: CompactionConfig::default(),
            compress_files: true,
        }
    }

    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Directory holding TSM files
    pub fn tsm_dir(&self) -> PathBuf {
        self.data_dir.join("tsm")
    }

    /// WAL directory; relative to `data_dir` unless absolute
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join(&self.wal.dir)
    }

    /// WAL configuration with its directory resolved
    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            dir: self.wal_dir(),
            ..self.wal.clone()
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.shard_count == 0 {
            return Err(TsmError::Config("cache.shard_count must be positive".into()));
        }
        if self.cache.max_memory_size > 0
            && self.cache.snapshot_memory_size > self.cache.max_memory_size
        {
            return Err(TsmError::Config(format!(
                "cache.snapshot_memory_size ({}) exceeds cache.max_memory_size ({})",
                self.cache.snapshot_memory_size, self.cache.max_memory_size
            )));
        }
        if self.wal.enabled && self.wal.segment_size == 0 {
            return Err(TsmError::Config("wal.segment_size must be positive".into()));
        }
        if self.compaction.file_trigger < 2 {
            return Err(TsmError::Config(
                "compaction.file_trigger must be at least 2".into(),
            ));
        }
        if self.compaction.check_interval_ms == 0 {
            return Err(TsmError::Config(
                "compaction.check_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_paths() {
        let mut config = EngineConfig::new("/var/lib/tsmdb");
        assert_eq!(config.wal_dir(), PathBuf::from("/var/lib/tsmdb/wal"));
        assert_eq!(config.wal_config().dir, config.wal_dir());
        assert_eq!(config.tsm_dir(), PathBuf::from("/var/lib/tsmdb/tsm"));
        config.validate().unwrap();

        config.wal.dir = PathBuf::from("/mnt/fast/wal");
        assert_eq!(config.wal_dir(), PathBuf::from("/mnt/fast/wal"));
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut config = EngineConfig::default();
        config.cache.max_memory_size = 1024;
        config.cache.snapshot_memory_size = 4096;
        assert!(matches!(config.validate(), Err(TsmError::Config(_))));

        let mut config = EngineConfig::default();
        config.cache.shard_count = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.compaction.file_trigger = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tsmdb.json");
        std::fs::write(
            &path,
            r#"{
                "data_dir": "/tmp/tsmdb",
                "cache": { "max_memory_size": 1048576, "snapshot_memory_size": 65536, "shard_count": 4 },
                "wal": { "sync_policy": { "every_n": 8 } },
                "compress_files": false
            }"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tsmdb"));
        assert_eq!(config.wal_dir(), PathBuf::from("/tmp/tsmdb/wal"));
        assert_eq!(config.cache.shard_count, 4);
        assert_eq!(config.wal.sync_policy, crate::wal::SyncPolicy::EveryN(8));
        assert!(!config.compress_files);
        assert_eq!(config.compaction.file_trigger, crate::config::LEVEL_COMPACTION_TRIGGER);

        std::fs::write(&path, r#"{ "cache": { "max_memory_size": 10, "snapshot_memory_size": 20, "shard_count": 1 } }"#).unwrap();
        assert!(EngineConfig::from_json_file(&path).is_err());
    }
}
