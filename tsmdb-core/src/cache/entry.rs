//! Per-key value buffer

use super::value::{self, Value};
use crate::{Timestamp, ValueType};
use parking_lot::RwLock;

/// A write whose values do not share the entry's type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMismatch {
    pub existing: ValueType,
    pub attempted: ValueType,
}

/// Values of a single key.
///
/// Appends are unsorted; readers get a sorted, deduplicated copy. The type of
/// the first value fixes the type of the entry.
#[derive(Debug)]
pub struct Entry {
    inner: RwLock<EntryInner>,
}

#[derive(Debug)]
struct EntryInner {
    values: Vec<Value>,
    vtype: ValueType,
    size: usize,
}

impl Entry {
    /// Create an entry of type `vtype` holding its first batch.
    /// Fails if the batch is not entirely of that type.
    pub fn new(vtype: ValueType, values: &[Value]) -> std::result::Result<Self, TypeMismatch> {
        check_type(vtype, values)?;

        Ok(Self {
            inner: RwLock::new(EntryInner {
                values: values.to_vec(),
                vtype,
                size: value::values_size(values),
            }),
        })
    }

    /// Append values. Nothing is appended if any value has the wrong type.
    pub fn add(&self, values: &[Value]) -> std::result::Result<(), TypeMismatch> {
        let mut inner = self.inner.write();
        check_type(inner.vtype, values)?;
        inner.size += value::values_size(values);
        inner.values.extend_from_slice(values);
        Ok(())
    }

    /// Sort and collapse duplicate timestamps in place; returns the bytes freed
    pub fn deduplicate(&self) -> usize {
        let mut inner = self.inner.write();
        inner.dedupe()
    }

    /// Remove values in `[min, max]`; returns the bytes freed
    pub fn filter(&self, min: Timestamp, max: Timestamp) -> usize {
        let mut inner = self.inner.write();
        let before = inner.size;
        inner.dedupe();
        value::exclude(&mut inner.values, min, max);
        inner.size = value::values_size(&inner.values);
        before - inner.size
    }

    /// Drop every value; returns the bytes freed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let freed = inner.size;
        inner.values.clear();
        inner.size = 0;
        freed
    }

    /// Sorted, deduplicated copy of the values
    pub fn values(&self) -> Vec<Value> {
        let inner = self.inner.read();
        let mut values = inner.values.clone();
        value::deduplicate(&mut values);
        values
    }

    /// Values in append order
    pub(crate) fn raw_values(&self) -> Vec<Value> {
        self.inner.read().values.clone()
    }

    pub fn value_type(&self) -> ValueType {
        self.inner.read().vtype
    }

    pub fn count(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Accounted size of the values, excluding the key
    pub fn size(&self) -> usize {
        self.inner.read().size
    }
}

impl EntryInner {
    fn dedupe(&mut self) -> usize {
        if value::is_sorted_unique(&self.values) {
            return 0;
        }
        let before = self.size;
        value::deduplicate(&mut self.values);
        self.size = value::values_size(&self.values);
        before - self.size
    }
}

fn check_type(vtype: ValueType, values: &[Value]) -> std::result::Result<(), TypeMismatch> {
    match values.iter().find(|v| v.value_type() != vtype) {
        Some(bad) => Err(TypeMismatch {
            existing: vtype,
            attempted: bad.value_type(),
        }),
        None => Ok(()),
    }
}
