//! Sort keys.
//!
//! A sort key is the tuple a scan is ordered by: the primary-key values
//! for a primary scan, `[index key parts…, pk parts…]` for a secondary
//! scan. Keys compare with binary text semantics; collation-sensitive
//! columns are folded at key-construction time via
//! [`Value::collate_key`](super::Value::collate_key), which keeps the
//! key order total and lets sort keys serve as B-tree map keys.

use super::{Collation, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An ordered key tuple with a total order over all value classes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SortKey(pub Vec<Value>);

impl SortKey {
    pub fn new(parts: Vec<Value>) -> Self {
        SortKey(parts)
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenate two keys, e.g. index parts followed by pk parts
    pub fn concat(&self, suffix: &SortKey) -> SortKey {
        let mut parts = self.0.clone();
        parts.extend(suffix.0.iter().cloned());
        SortKey(parts)
    }

    /// Compare two keys part-wise; a shorter key that is a prefix of a
    /// longer one orders first
    pub fn compare(&self, other: &SortKey) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match Value::compare(a, b, Collation::Binary) {
                Ordering::Equal => {}
                non_eq => return non_eq,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_part_ordering() {
        let a = SortKey::new(vec![Value::Integer(1)]);
        let b = SortKey::new(vec![Value::Integer(2)]);
        assert!(a < b);
        assert_eq!(a, SortKey::new(vec![Value::Integer(1)]));
    }

    #[test]
    fn test_composite_ordering() {
        let a = SortKey::new(vec![Value::Text("a".into()), Value::Integer(9)]);
        let b = SortKey::new(vec![Value::Text("a".into()), Value::Integer(10)]);
        let c = SortKey::new(vec![Value::Text("b".into()), Value::Integer(0)]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_prefix_orders_first() {
        let short = SortKey::new(vec![Value::Integer(1)]);
        let long = SortKey::new(vec![Value::Integer(1), Value::Integer(0)]);
        assert!(short < long);
    }

    #[test]
    fn test_numeric_classes_merge() {
        let int = SortKey::new(vec![Value::Integer(3)]);
        let real = SortKey::new(vec![Value::Real(3.0)]);
        assert_eq!(int, real);
    }

    #[test]
    fn test_concat() {
        let index_part = SortKey::new(vec![Value::Text("x".into())]);
        let pk = SortKey::new(vec![Value::Integer(5)]);
        let combined = index_part.concat(&pk);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined.parts()[1], Value::Integer(5));
    }
}
