//! # Isolation Overlay
//!
//! Per-connection, per-transaction mutation buffer. The overlay is a
//! stack of sorted layers keyed by primary key (and, per secondary
//! index, by `[index key parts…, pk parts…]`). Savepoints push layers;
//! releasing a savepoint merges its layers downward; rolling back to a
//! savepoint discards them. Between transactions the overlay is empty.
//!
//! Reads merge the overlay with the base scan through
//! [`merge::merge_scan`], which preserves sort-key order and gives
//! overlay entries precedence on primary-key ties (read-your-writes).

pub mod merge;

use crate::value::{SortKey, Value};
use std::collections::{BTreeMap, HashMap};

/// One buffered mutation
#[derive(Debug, Clone)]
pub struct MergeEntry {
    /// Row image; meaningless when `tombstone` is set
    pub row: Vec<Value>,
    /// The primary key is deleted; any base row with it is suppressed
    pub tombstone: bool,
    pub pk: SortKey,
    /// Position of this entry in the scan it participates in
    pub sort_key: SortKey,
}

impl MergeEntry {
    pub fn upsert(row: Vec<Value>, pk: SortKey, sort_key: SortKey) -> Self {
        MergeEntry {
            row,
            tombstone: false,
            pk,
            sort_key,
        }
    }

    pub fn tombstone(pk: SortKey, sort_key: SortKey) -> Self {
        MergeEntry {
            row: Vec::new(),
            tombstone: true,
            pk,
            sort_key,
        }
    }
}

/// One savepoint layer: primary view plus a projection per index
#[derive(Debug, Default)]
struct OverlayLayer {
    by_pk: BTreeMap<SortKey, MergeEntry>,
    by_index: HashMap<String, BTreeMap<SortKey, MergeEntry>>,
}

/// A stack of overlay layers for one connection's open transaction
#[derive(Debug, Default)]
pub struct TransactionOverlay {
    layers: Vec<OverlayLayer>,
}

impl TransactionOverlay {
    pub fn new() -> Self {
        TransactionOverlay { layers: Vec::new() }
    }

    /// Whether a transaction is open on this overlay
    pub fn is_active(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Whether the transaction has buffered any mutation
    pub fn is_empty(&self) -> bool {
        self.layers
            .iter()
            .all(|layer| layer.by_pk.is_empty())
    }

    /// Open the transaction with a single base layer
    pub fn begin(&mut self) {
        debug_assert!(self.layers.is_empty());
        self.layers.push(OverlayLayer::default());
    }

    /// Drop every layer (commit flushed them, or rollback discards them)
    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Push a savepoint layer; returns its depth for later release or
    /// rollback
    pub fn push_layer(&mut self) -> usize {
        self.layers.push(OverlayLayer::default());
        self.layers.len() - 1
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Merge layers at and above `depth` into the layer below it
    pub fn merge_down(&mut self, depth: usize) {
        while self.layers.len() > depth {
            let top = match self.layers.pop() {
                Some(layer) => layer,
                None => return,
            };
            let Some(parent) = self.layers.last_mut() else {
                // Merging the base layer is a no-op; put it back
                self.layers.push(top);
                return;
            };
            for (pk, entry) in top.by_pk {
                parent.by_pk.insert(pk, entry);
            }
            for (index, entries) in top.by_index {
                let target = parent.by_index.entry(index).or_default();
                for (key, entry) in entries {
                    target.insert(key, entry);
                }
            }
        }
    }

    /// Discard layers at and above `depth`
    pub fn truncate(&mut self, depth: usize) {
        self.layers.truncate(depth);
    }

    /// Record a mutation in the top layer: the primary entry plus one
    /// projected entry per maintained secondary index
    pub fn record(&mut self, primary: MergeEntry, per_index: Vec<(String, MergeEntry)>) {
        let Some(top) = self.layers.last_mut() else {
            debug_assert!(false, "record outside an open transaction");
            return;
        };
        top.by_pk.insert(primary.pk.clone(), primary);
        for (index, entry) in per_index {
            top.by_index
                .entry(index)
                .or_default()
                .insert(entry.sort_key.clone(), entry);
        }
    }

    /// Record secondary-index projections for mutations already
    /// recorded against the primary view
    pub fn record_index_entries(&mut self, entries: Vec<(String, MergeEntry)>) {
        let Some(top) = self.layers.last_mut() else {
            debug_assert!(false, "record outside an open transaction");
            return;
        };
        for (index, entry) in entries {
            top.by_index
                .entry(index)
                .or_default()
                .insert(entry.sort_key.clone(), entry);
        }
    }

    /// Overlay verdict for a primary key, newest layer first.
    /// `None` when the overlay says nothing; otherwise the row image,
    /// with `None` meaning tombstoned.
    pub fn visible(&self, pk: &SortKey) -> Option<Option<Vec<Value>>> {
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.by_pk.get(pk) {
                return Some(if entry.tombstone {
                    None
                } else {
                    Some(entry.row.clone())
                });
            }
        }
        None
    }

    /// Effective primary view: layers collapsed bottom-to-top
    pub fn effective_primary(&self) -> BTreeMap<SortKey, MergeEntry> {
        let mut merged = BTreeMap::new();
        for layer in &self.layers {
            for (pk, entry) in &layer.by_pk {
                merged.insert(pk.clone(), entry.clone());
            }
        }
        merged
    }

    /// Effective view of one secondary index projection
    pub fn effective_index(&self, index: &str) -> BTreeMap<SortKey, MergeEntry> {
        let mut merged = BTreeMap::new();
        for layer in &self.layers {
            if let Some(entries) = layer.by_index.get(index) {
                for (key, entry) in entries {
                    merged.insert(key.clone(), entry.clone());
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(i: i64) -> SortKey {
        SortKey::new(vec![Value::Integer(i)])
    }

    fn upsert(i: i64, text: &str) -> MergeEntry {
        MergeEntry::upsert(
            vec![Value::Integer(i), Value::Text(text.into())],
            pk(i),
            pk(i),
        )
    }

    #[test]
    fn test_overlay_lifecycle() {
        let mut overlay = TransactionOverlay::new();
        assert!(!overlay.is_active());
        overlay.begin();
        assert!(overlay.is_active());
        assert!(overlay.is_empty());
        overlay.record(upsert(1, "a"), vec![]);
        assert!(!overlay.is_empty());
        overlay.clear();
        assert!(!overlay.is_active());
    }

    #[test]
    fn test_visible_prefers_newest_layer() {
        let mut overlay = TransactionOverlay::new();
        overlay.begin();
        overlay.record(upsert(1, "old"), vec![]);
        overlay.push_layer();
        overlay.record(upsert(1, "new"), vec![]);
        let row = overlay.visible(&pk(1)).expect("entry").expect("live");
        assert_eq!(row[1], Value::Text("new".into()));
    }

    #[test]
    fn test_tombstone_visibility() {
        let mut overlay = TransactionOverlay::new();
        overlay.begin();
        overlay.record(upsert(1, "a"), vec![]);
        overlay.push_layer();
        overlay.record(MergeEntry::tombstone(pk(1), pk(1)), vec![]);
        assert_eq!(overlay.visible(&pk(1)), Some(None));
    }

    #[test]
    fn test_release_merges_layer_down() {
        let mut overlay = TransactionOverlay::new();
        overlay.begin();
        overlay.record(upsert(1, "base"), vec![]);
        let depth = overlay.push_layer();
        overlay.record(upsert(2, "sp"), vec![]);
        overlay.merge_down(depth);
        assert_eq!(overlay.depth(), 1);
        assert!(overlay.visible(&pk(1)).is_some());
        assert!(overlay.visible(&pk(2)).is_some());
    }

    #[test]
    fn test_rollback_to_discards_layers() {
        let mut overlay = TransactionOverlay::new();
        overlay.begin();
        overlay.record(upsert(1, "base"), vec![]);
        let depth = overlay.push_layer();
        overlay.record(upsert(2, "sp"), vec![]);
        overlay.truncate(depth);
        assert!(overlay.visible(&pk(1)).is_some());
        assert_eq!(overlay.visible(&pk(2)), None);
    }

    #[test]
    fn test_effective_primary_collapses_layers() {
        let mut overlay = TransactionOverlay::new();
        overlay.begin();
        overlay.record(upsert(1, "a"), vec![]);
        overlay.record(upsert(2, "b"), vec![]);
        overlay.push_layer();
        overlay.record(MergeEntry::tombstone(pk(1), pk(1)), vec![]);
        let effective = overlay.effective_primary();
        assert_eq!(effective.len(), 2);
        assert!(effective.get(&pk(1)).expect("entry").tombstone);
        assert!(!effective.get(&pk(2)).expect("entry").tombstone);
    }

    #[test]
    fn test_index_projection() {
        let mut overlay = TransactionOverlay::new();
        overlay.begin();
        let index_key = SortKey::new(vec![Value::Text("x".into()), Value::Integer(1)]);
        let entry = MergeEntry::upsert(
            vec![Value::Integer(1), Value::Text("x".into())],
            pk(1),
            index_key.clone(),
        );
        overlay.record(upsert(1, "x"), vec![("t_name".into(), entry)]);
        let projected = overlay.effective_index("t_name");
        assert_eq!(projected.len(), 1);
        assert!(projected.contains_key(&index_key));
        assert!(overlay.effective_index("other").is_empty());
    }
}
