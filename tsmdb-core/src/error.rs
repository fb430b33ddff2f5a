//! Error types for tsmdb

use crate::types::ValueType;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tsmdb operations
pub type Result<T> = std::result::Result<T, TsmError>;

/// tsmdb error types
#[derive(Error, Debug)]
pub enum TsmError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Encoding or decoding of a serialized structure failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A value's type does not match the type already established for its key
    #[error("field type conflict: key {key} is {existing}, got {attempted}")]
    TypeConflict {
        key: String,
        existing: ValueType,
        attempted: ValueType,
    },

    /// Accepting the write would push the cache over its memory ceiling
    #[error("cache-max-memory-size exceeded: ({size}/{limit})")]
    CapacityExceeded { size: u64, limit: u64 },

    /// Some keys of a multi-key write were rejected
    #[error(transparent)]
    PartialWrite(#[from] PartialWriteError),

    /// A WAL segment ended in a malformed record
    #[error("corrupt WAL segment {path:?} at offset {offset}: {reason}")]
    CorruptSegment {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// A cache snapshot is already being flushed
    #[error("snapshot in progress")]
    SnapshotInProgress,

    /// Predicate could not be built, marshalled or evaluated
    #[error("Predicate error: {0}")]
    Predicate(String),

    /// Point rejected before reaching the cache
    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tag index or series catalog error
    #[error("Index error: {0}")]
    Index(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// The engine is not open
    #[error("engine is closed")]
    EngineClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TsmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TsmError::Io(_) | TsmError::SnapshotInProgress | TsmError::Cancelled
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TsmError::Corruption(_)
                | TsmError::ChecksumMismatch { .. }
                | TsmError::CorruptSegment { .. }
        )
    }

    /// The write did not fit in the cache
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, TsmError::CapacityExceeded { .. })
    }

    /// The write carried a value of the wrong type
    pub fn is_type_conflict(&self) -> bool {
        matches!(self, TsmError::TypeConflict { .. })
    }

    pub(crate) fn type_conflict(key: &[u8], existing: ValueType, attempted: ValueType) -> Self {
        TsmError::TypeConflict {
            key: String::from_utf8_lossy(key).into_owned(),
            existing,
            attempted,
        }
    }
}

impl From<bincode::Error> for TsmError {
    fn from(e: bincode::Error) -> Self {
        TsmError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TsmError {
    fn from(e: serde_json::Error) -> Self {
        TsmError::Serialization(e.to_string())
    }
}

/// One rejected key of a multi-key write
#[derive(Debug)]
pub struct WriteFailure {
    /// Composite key that was rejected
    pub key: Vec<u8>,
    /// Why it was rejected
    pub reason: TsmError,
}

/// Aggregate of the per-key failures of a multi-key write.
///
/// Keys not listed here were applied.
#[derive(Debug, Default)]
pub struct PartialWriteError {
    pub failures: Vec<WriteFailure>,
}

impl PartialWriteError {
    /// Keys rejected because the cache was full
    pub fn dropped(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| f.reason.is_capacity_exceeded())
            .count()
    }

    /// Keys rejected because of a type conflict
    pub fn conflicted(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| f.reason.is_type_conflict())
            .count()
    }

    pub fn failed_keys(&self) -> impl Iterator<Item = &[u8]> {
        self.failures.iter().map(|f| f.key.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for PartialWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partial write: {} keys rejected ({} dropped, {} type conflicts)",
            self.failures.len(),
            self.dropped(),
            self.conflicted()
        )?;
        if let Some(first) = self.failures.first() {
            write!(f, ": {}", first.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialWriteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_write_counts() {
        let err = PartialWriteError {
            failures: vec![
                WriteFailure {
                    key: b"foo".to_vec(),
                    reason: TsmError::type_conflict(b"foo", ValueType::Float, ValueType::Integer),
                },
                WriteFailure {
                    key: b"bar".to_vec(),
                    reason: TsmError::CapacityExceeded { size: 10, limit: 5 },
                },
            ],
        };

        assert_eq!(err.dropped(), 1);
        assert_eq!(err.conflicted(), 1);
        let keys: Vec<&[u8]> = err.failed_keys().collect();
        assert_eq!(keys, vec![b"foo".as_slice(), b"bar".as_slice()]);
        assert!(err.to_string().contains("2 keys rejected"));
    }

    #[test]
    fn test_capacity_message_names_setting() {
        let err = TsmError::CapacityExceeded { size: 32, limit: 16 };
        assert!(err.to_string().contains("cache-max-memory-size"));
        assert!(err.is_capacity_exceeded());
        assert!(!err.is_type_conflict());
    }

    #[test]
    fn test_error_classification() {
        assert!(TsmError::SnapshotInProgress.is_retryable());
        assert!(TsmError::Cancelled.is_retryable());
        assert!(!TsmError::EngineClosed.is_retryable());

        assert!(TsmError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
        assert!(TsmError::Corruption("bad block".into()).is_corruption());
        assert!(!TsmError::Predicate("bad".into()).is_corruption());
    }
}
