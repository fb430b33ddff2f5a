//! Timestamped values held by the cache

use crate::{FieldValue, Timestamp, ValueType};
use serde::{Deserialize, Serialize};

/// Bytes charged for the timestamp of every value
pub const TIMESTAMP_SIZE: usize = 8;

/// A single timestamped value of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Payload
    pub field: FieldValue,
}

impl Value {
    /// Create a new value
    pub fn new(timestamp: Timestamp, field: impl Into<FieldValue>) -> Self {
        Self {
            timestamp,
            field: field.into(),
        }
    }

    /// Accounted size: timestamp plus payload
    pub fn size(&self) -> usize {
        TIMESTAMP_SIZE + self.field.size()
    }

    /// Scalar type of the payload
    pub fn value_type(&self) -> ValueType {
        self.field.value_type()
    }
}

/// Sum of the accounted sizes of `values`
pub fn values_size(values: &[Value]) -> usize {
    values.iter().map(Value::size).sum()
}

/// True if timestamps are strictly ascending
pub fn is_sorted_unique(values: &[Value]) -> bool {
    values.windows(2).all(|w| w[0].timestamp < w[1].timestamp)
}

/// Sort ascending by timestamp and collapse duplicates.
///
/// The sort is stable, so among values sharing a timestamp the one written
/// last survives.
pub fn deduplicate(values: &mut Vec<Value>) {
    if is_sorted_unique(values) {
        return;
    }

    values.sort_by_key(|v| v.timestamp);

    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values.drain(..) {
        match out.last_mut() {
            Some(last) if last.timestamp == v.timestamp => *last = v,
            _ => out.push(v),
        }
    }
    *values = out;
}

/// Remove every value with a timestamp in `[min, max]`
pub fn exclude(values: &mut Vec<Value>, min: Timestamp, max: Timestamp) {
    values.retain(|v| v.timestamp < min || v.timestamp > max);
}
