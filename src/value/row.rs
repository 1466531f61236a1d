//! Rows and row metadata.
//!
//! A row is an ordered sequence of values indexed from zero. An *expanded*
//! row additionally carries a metadata sidecar used by the mutation
//! pipeline: the original primary-key values for UPDATE/DELETE targeting
//! and the old/new pair consumed by constraint checks. The sidecar never
//! occupies positional columns.

use super::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Old/new row pair attached for constraint evaluation during UPDATE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRowData {
    pub old_row: Vec<Value>,
    pub new_row: Vec<Value>,
}

/// Sidecar metadata for expanded rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowMeta {
    /// Primary-key values of the row as it was read, retained until the
    /// mutation executor runs
    pub old_key_values: Option<Vec<Value>>,
    /// Old/new pair for UPDATE constraint checks
    pub update_data: Option<UpdateRowData>,
}

/// An ordered sequence of values, optionally expanded with metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    values: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    meta: Option<Arc<RowMeta>>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Row { values, meta: None }
    }

    /// The zero-width row produced by a FROM-less SELECT source
    pub fn empty() -> Self {
        Row::new(Vec::new())
    }

    pub fn with_meta(values: Vec<Value>, meta: RowMeta) -> Self {
        Row {
            values,
            meta: Some(Arc::new(meta)),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn meta(&self) -> Option<&RowMeta> {
        self.meta.as_deref()
    }

    /// Original primary-key values, when this row flows through a
    /// mutation pipeline
    pub fn old_key_values(&self) -> Option<&[Value]> {
        self.meta
            .as_deref()
            .and_then(|m| m.old_key_values.as_deref())
    }

    /// Replace the positional values, keeping the sidecar
    pub fn map_values(self, values: Vec<Value>) -> Row {
        Row {
            values,
            meta: self.meta,
        }
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_indexing() {
        let row = Row::new(vec![Value::Integer(1), Value::Text("a".into())]);
        assert_eq!(row.arity(), 2);
        assert_eq!(row.get(0), Some(&Value::Integer(1)));
        assert_eq!(row.get(2), None);
    }

    #[test]
    fn test_meta_survives_value_mapping() {
        let meta = RowMeta {
            old_key_values: Some(vec![Value::Integer(7)]),
            update_data: None,
        };
        let row = Row::with_meta(vec![Value::Integer(7), Value::Text("x".into())], meta);
        let mapped = row.map_values(vec![Value::Integer(7), Value::Text("y".into())]);
        assert_eq!(mapped.old_key_values(), Some(&[Value::Integer(7)][..]));
    }

    #[test]
    fn test_empty_row() {
        let row = Row::empty();
        assert!(row.is_empty());
        assert!(row.meta().is_none());
    }
}
