//! Core types for tsmdb

use crate::{Result, TsmError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Smallest representable timestamp
pub const MIN_TIME: Timestamp = i64::MIN;

/// Largest representable timestamp
pub const MAX_TIME: Timestamp = i64::MAX;

/// Separates the series key from the field name inside a composite key
pub const FIELD_KEY_SEPARATOR: &[u8] = b"#!~#";

/// Pseudo tag exposing the measurement name to predicates
pub const MEASUREMENT_TAG_KEY: &str = "_measurement";

/// Pseudo tag exposing the field name to predicates
pub const FIELD_TAG_KEY: &str = "_field";

/// Scalar type of the values stored under one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    Float = 1,
    Integer = 2,
    Unsigned = 3,
    Boolean = 4,
    String = 5,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Float => "float",
            ValueType::Integer => "integer",
            ValueType::Unsigned => "unsigned",
            ValueType::Boolean => "boolean",
            ValueType::String => "string",
        };
        f.write_str(name)
    }
}

/// Series key combining measurement and tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Measurement name (e.g., "temperature", "cpu_usage")
    pub measurement: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the series key
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Look up a tag, including the `_measurement` pseudo tag
    pub fn tag(&self, key: &str) -> Option<&str> {
        if key == MEASUREMENT_TAG_KEY {
            return Some(&self.measurement);
        }
        self.tags.get(key).map(String::as_str)
    }

    /// Encode to the byte form used as the series part of cache and file keys.
    ///
    /// `measurement,k1=v1,k2=v2` with tags in key order; separators inside names
    /// are escaped with a backslash.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = escape_measurement(&self.measurement);
        for (k, v) in &self.tags {
            buf.push(b',');
            escape_into(&mut buf, k, TAG_ESCAPES);
            buf.push(b'=');
            escape_into(&mut buf, v, TAG_ESCAPES);
        }
        buf
    }

    /// Parse the byte form produced by [`SeriesKey::encode`]
    pub fn parse(key: &[u8]) -> Result<Self> {
        let mut parts = split_unescaped(key, b',').into_iter();
        let measurement = match parts.next() {
            Some(m) if !m.is_empty() => unescape_measurement(m)?,
            _ => return Err(TsmError::InvalidFormat("series key without measurement".into())),
        };

        let mut tags = BTreeMap::new();
        for part in parts {
            let kv = split_unescaped(part, b'=');
            if kv.len() != 2 || kv[0].is_empty() {
                return Err(TsmError::InvalidFormat(format!(
                    "malformed tag in series key {:?}",
                    String::from_utf8_lossy(key)
                )));
            }
            tags.insert(utf8(unescape(kv[0]))?, utf8(unescape(kv[1]))?);
        }

        Ok(Self { measurement, tags })
    }

    /// Create a canonical string representation for hashing
    pub fn canonical(&self) -> String {
        String::from_utf8_lossy(&self.encode()).into_owned()
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A single data point with timestamp and value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Field values
    pub fields: Fields,
}

impl DataPoint {
    /// Create a new data point with a single field
    pub fn new(timestamp: Timestamp, field_name: impl Into<String>, value: FieldValue) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field_name.into(), value);
        Self {
            timestamp,
            fields: Fields(fields),
        }
    }

    /// Add another field to the data point
    pub fn with_field(mut self, field_name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(field_name, value);
        self
    }
}

/// Field values container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fields(pub BTreeMap<String, FieldValue>);

impl Fields {
    /// Create empty fields
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add a field
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over fields
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }
}

impl Default for Fields {
    fn default() -> Self {
        Self::new()
    }
}

/// Possible field value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit unsigned integer
    Unsigned(u64),
    /// Boolean
    Boolean(bool),
    /// String
    String(String),
}

impl FieldValue {
    /// Get the payload size in bytes
    pub fn size(&self) -> usize {
        match self {
            FieldValue::Float(_) => 8,
            FieldValue::Integer(_) => 8,
            FieldValue::Unsigned(_) => 8,
            FieldValue::Boolean(_) => 1,
            FieldValue::String(s) => s.len(),
        }
    }

    /// The scalar type of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldValue::Float(_) => ValueType::Float,
            FieldValue::Integer(_) => ValueType::Integer,
            FieldValue::Unsigned(_) => ValueType::Unsigned,
            FieldValue::Boolean(_) => ValueType::Boolean,
            FieldValue::String(_) => ValueType::String,
        }
    }

    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Unsigned(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Float(v) => Some(*v as i64),
            FieldValue::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Unsigned(v) => write!(f, "{}u", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Unsigned(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// A complete point with series key and data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    /// Series key (measurement + tags)
    pub key: SeriesKey,
    /// Data point (timestamp + fields)
    pub data: DataPoint,
}

impl Point {
    /// Create a new point
    pub fn new(key: SeriesKey, data: DataPoint) -> Self {
        Self { key, data }
    }

    /// Reject points the storage layer cannot key unambiguously
    pub fn validate(&self) -> Result<()> {
        if self.key.measurement.is_empty() {
            return Err(TsmError::InvalidPoint("missing measurement".into()));
        }
        if contains(self.key.measurement.as_bytes(), FIELD_KEY_SEPARATOR) {
            return Err(TsmError::InvalidPoint(format!(
                "invalid measurement {:?}",
                self.key.measurement
            )));
        }
        if self.data.fields.is_empty() {
            return Err(TsmError::InvalidPoint(format!(
                "{}: point has no fields",
                self.key
            )));
        }
        for (tag, value) in self.key.tags.iter() {
            if tag.is_empty()
                || is_reserved_name(tag)
                || contains(tag.as_bytes(), FIELD_KEY_SEPARATOR)
            {
                return Err(TsmError::InvalidPoint(format!(
                    "{}: invalid tag key {:?}",
                    self.key, tag
                )));
            }
            if contains(value.as_bytes(), FIELD_KEY_SEPARATOR) {
                return Err(TsmError::InvalidPoint(format!(
                    "{}: invalid tag value {:?}",
                    self.key, value
                )));
            }
        }
        for field in self.data.fields.0.keys() {
            if field.is_empty()
                || is_reserved_name(field)
                || contains(field.as_bytes(), FIELD_KEY_SEPARATOR)
            {
                return Err(TsmError::InvalidPoint(format!(
                    "{}: invalid field key {:?}",
                    self.key, field
                )));
            }
        }
        Ok(())
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The range covering every timestamp
    pub fn all() -> Self {
        Self::new(MIN_TIME, MAX_TIME)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// True if the range spans the whole timeline
    pub fn is_unbounded(&self) -> bool {
        self.start == MIN_TIME && self.end == MAX_TIME
    }
}

/// Build the composite `series#!~#field` key for a cache or file entry
pub fn composite_key(series: &[u8], field: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(series.len() + FIELD_KEY_SEPARATOR.len() + field.len());
    key.extend_from_slice(series);
    key.extend_from_slice(FIELD_KEY_SEPARATOR);
    key.extend_from_slice(field.as_bytes());
    key
}

/// Split a composite key into its series key and field parts.
///
/// A key without a separator is all series.
pub fn series_and_field(key: &[u8]) -> (&[u8], &[u8]) {
    match find(key, FIELD_KEY_SEPARATOR) {
        Some(i) => (&key[..i], &key[i + FIELD_KEY_SEPARATOR.len()..]),
        None => (key, &[]),
    }
}

/// True if `key` belongs to exactly the (escaped) measurement `name`,
/// so that `cpu` does not match keys of `cpu2`.
pub fn has_measurement_prefix(key: &[u8], name: &[u8]) -> bool {
    if !key.starts_with(name) {
        return false;
    }
    let rest = &key[name.len()..];
    rest.is_empty() || rest[0] == b',' || rest.starts_with(FIELD_KEY_SEPARATOR)
}

/// Escape a measurement name into its key form
pub fn escape_measurement(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len());
    escape_into(&mut buf, name, MEASUREMENT_ESCAPES);
    buf
}

/// Reverse [`escape_measurement`]
pub fn unescape_measurement(name: &[u8]) -> Result<String> {
    utf8(unescape(name))
}

const MEASUREMENT_ESCAPES: &[u8] = b", \\";
const TAG_ESCAPES: &[u8] = b",= \\";

fn is_reserved_name(name: &str) -> bool {
    name == "time" || name == MEASUREMENT_TAG_KEY || name == FIELD_TAG_KEY
}

fn escape_into(buf: &mut Vec<u8>, s: &str, specials: &[u8]) {
    for &b in s.as_bytes() {
        if specials.contains(&b) {
            buf.push(b'\\');
        }
        buf.push(b);
    }
}

fn unescape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\\' && i + 1 < input.len() {
            out.push(input[i + 1]);
            i += 2;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

fn split_unescaped(input: &[u8], sep: u8) -> Vec<&[u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\\' {
            i += 2;
        } else if input[i] == sep {
            parts.push(&input[start..i]);
            i += 1;
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(&input[start.min(input.len())..]);
    parts
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| TsmError::InvalidFormat(e.to_string()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}
