//! Key predicates for scoped deletes
//!
//! A predicate decides whether a composite `series#!~#field` key is affected by a
//! delete. Predicates that travel through the WAL also have a wire form.

mod expr;

pub use expr::{ComparisonOp, ExprPredicate, LogicalOp, Node};

use crate::{has_measurement_prefix, Result, TsmError};

/// Capability to select composite keys
pub trait Predicate: Send + Sync {
    /// True if the delete applies to `key`
    fn matches(&self, key: &[u8]) -> bool;

    /// Wire form, decodable with [`unmarshal`]
    fn marshal(&self) -> Result<Vec<u8>>;
}

/// Decode a predicate from its wire form
pub fn unmarshal(bytes: &[u8]) -> Result<Box<dyn Predicate>> {
    Ok(Box::new(ExprPredicate::unmarshal(bytes)?))
}

/// Matches exactly one composite key. Has no wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEquals(pub Vec<u8>);

impl KeyEquals {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }
}

impl Predicate for KeyEquals {
    fn matches(&self, key: &[u8]) -> bool {
        self.0 == key
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        Err(TsmError::Predicate(
            "exact key predicate cannot be marshalled".into(),
        ))
    }
}

/// Restricts keys to one measurement, then applies an optional inner predicate.
///
/// Plain prefix matching would let `cpu` select keys of `cpu2`.
pub struct MeasurementPredicate<'a> {
    name: &'a [u8],
    inner: Option<&'a dyn Predicate>,
}

impl<'a> MeasurementPredicate<'a> {
    /// `name` is the escaped measurement as it appears in keys
    pub fn new(name: &'a [u8], inner: Option<&'a dyn Predicate>) -> Self {
        Self { name, inner }
    }
}

impl Predicate for MeasurementPredicate<'_> {
    fn matches(&self, key: &[u8]) -> bool {
        has_measurement_prefix(key, self.name) && self.inner.map_or(true, |p| p.matches(key))
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        match self.inner {
            Some(p) => p.marshal(),
            None => Err(TsmError::Predicate(
                "measurement scope has no wire form".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equals() {
        let p = KeyEquals::new("fee");
        assert!(p.matches(b"fee"));
        assert!(!p.matches(b"foo"));
        assert!(p.marshal().is_err());
    }

    #[test]
    fn test_measurement_predicate_respects_boundary() {
        let p = MeasurementPredicate::new(b"cpu", None);
        assert!(p.matches(b"cpu,host=a#!~#value"));
        assert!(!p.matches(b"cpu2,host=a#!~#value"));

        let inner = KeyEquals::new("cpu,host=b#!~#value");
        let p = MeasurementPredicate::new(b"cpu", Some(&inner));
        assert!(!p.matches(b"cpu,host=a#!~#value"));
        assert!(p.matches(b"cpu,host=b#!~#value"));
    }

    #[test]
    fn test_unmarshal_round_trip() {
        let node = Node::tag_eq("host", "a");
        let bytes = ExprPredicate::new(node).unwrap().marshal().unwrap();
        let p = unmarshal(&bytes).unwrap();
        assert!(p.matches(b"cpu,host=a#!~#value"));
        assert!(!p.matches(b"cpu,host=b#!~#value"));
    }
}
