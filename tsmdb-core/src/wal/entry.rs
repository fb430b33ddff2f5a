//! WAL entry types and serialization

use crate::cache::WriteBatch;
use crate::{Result, Timestamp, TsmError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the fixed record header
pub const RECORD_HEADER_SIZE: usize = 10;

/// Flag bit: payload is lz4-compressed with its size prepended
pub const FLAG_LZ4: u8 = 0x01;

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// Write values
    Write = 1,
    /// Delete a time range from explicit keys
    DeleteRange = 2,
    /// Delete a time range from every key of a measurement
    DeleteBucketRange = 3,
}

impl TryFrom<u8> for WalEntryType {
    type Error = TsmError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Write),
            2 => Ok(WalEntryType::DeleteRange),
            3 => Ok(WalEntryType::DeleteBucketRange),
            _ => Err(TsmError::InvalidFormat(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// A single WAL entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// Values to add to the cache
    Write { values: WriteBatch },
    /// Remove `[min, max]` from the listed keys
    DeleteRange {
        keys: Vec<Vec<u8>>,
        min: Timestamp,
        max: Timestamp,
    },
    /// Remove `[min, max]` from keys of measurement `name` matching the
    /// marshalled predicate, if any
    DeleteBucketRange {
        name: Vec<u8>,
        min: Timestamp,
        max: Timestamp,
        predicate: Option<Vec<u8>>,
    },
}

impl WalEntry {
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalEntry::Write { .. } => WalEntryType::Write,
            WalEntry::DeleteRange { .. } => WalEntryType::DeleteRange,
            WalEntry::DeleteBucketRange { .. } => WalEntryType::DeleteBucketRange,
        }
    }

    /// Serialize the entry into a checksummed record
    ///
    /// Format:
    /// - 1 byte: entry type
    /// - 1 byte: flags
    /// - 4 bytes: payload length
    /// - 4 bytes: CRC32 of the payload as stored
    /// - N bytes: payload (bincode, lz4 if flagged)
    pub fn encode(&self, compression_threshold: usize) -> Result<Bytes> {
        let mut payload = bincode::serialize(self)?;
        let mut flags = 0u8;
        if compression_threshold > 0 && payload.len() >= compression_threshold {
            payload = lz4_flex::compress_prepend_size(&payload);
            flags |= FLAG_LZ4;
        }

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.put_u8(self.entry_type() as u8);
        buf.put_u8(flags);
        buf.put_u32_le(payload.len() as u32);
        buf.put_u32_le(crc32fast::hash(&payload));
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode one record from the front of `data`, validating its checksum.
    ///
    /// Returns the entry and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(TsmError::InvalidFormat("truncated record header".into()));
        }

        let mut header = &data[..RECORD_HEADER_SIZE];
        let entry_type = WalEntryType::try_from(header.get_u8())?;
        let flags = header.get_u8();
        let len = header.get_u32_le() as usize;
        let expected = header.get_u32_le();

        let end = RECORD_HEADER_SIZE + len;
        if data.len() < end {
            return Err(TsmError::InvalidFormat("truncated record payload".into()));
        }
        let stored = &data[RECORD_HEADER_SIZE..end];

        let actual = crc32fast::hash(stored);
        if expected != actual {
            return Err(TsmError::ChecksumMismatch { expected, actual });
        }

        let entry: WalEntry = if flags & FLAG_LZ4 != 0 {
            let raw = lz4_flex::decompress_size_prepended(stored)
                .map_err(|e| TsmError::Compression(e.to_string()))?;
            bincode::deserialize(&raw)?
        } else {
            bincode::deserialize(stored)?
        };

        if entry.entry_type() != entry_type {
            return Err(TsmError::Corruption(format!(
                "record header says {:?}, payload is {:?}",
                entry_type,
                entry.entry_type()
            )));
        }

        Ok((entry, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Value;

    fn write_entry(n: i64) -> WalEntry {
        let mut values = WriteBatch::new();
        for i in 0..n {
            values.insert(
                format!("cpu,host=h{i}#!~#value").into_bytes(),
                vec![Value::new(i, i as f64), Value::new(i + 1, 0.5)],
            );
        }
        WalEntry::Write { values }
    }

    #[test]
    fn test_entry_serialization() {
        let entry = write_entry(3);
        let encoded = entry.encode(0).unwrap();
        assert_eq!(encoded[0], WalEntryType::Write as u8);
        assert_eq!(encoded[1] & FLAG_LZ4, 0);

        let (decoded, len) = WalEntry::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_compressed_entry() {
        let entry = write_entry(200);
        let encoded = entry.encode(64).unwrap();
        assert_eq!(encoded[1] & FLAG_LZ4, FLAG_LZ4);

        let (decoded, _) = WalEntry::decode(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_delete_bucket_entry() {
        let entry = WalEntry::DeleteBucketRange {
            name: b"cpu".to_vec(),
            min: 10,
            max: 20,
            predicate: Some(vec![1, 2, 3]),
        };
        let encoded = entry.encode(0).unwrap();
        assert_eq!(encoded[0], WalEntryType::DeleteBucketRange as u8);
        assert_eq!(WalEntry::decode(&encoded).unwrap().0, entry);
    }

    #[test]
    fn test_checksum_validation() {
        let mut encoded = write_entry(1).encode(0).unwrap().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = WalEntry::decode(&encoded);
        assert!(matches!(result, Err(TsmError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_records() {
        let encoded = write_entry(1).encode(0).unwrap();
        assert!(WalEntry::decode(&encoded[..4]).is_err());
        assert!(WalEntry::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(WalEntry::decode(&[1, 4, 0, 0, 0]).is_err());
    }
}
