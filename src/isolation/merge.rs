//! Merge iterator.
//!
//! Two-way merge of a base scan and an overlay scan, both ordered by
//! sort key. Overlay entries win on primary-key ties; tombstones
//! suppress base rows. The output preserves sort-key order and yields
//! each primary key at most once.

use super::MergeEntry;
use crate::error::Result;
use crate::value::{SortKey, Value};
use std::cmp::Ordering;

/// A base-scan item: sort key, primary key, row image
pub type BaseItem = (SortKey, SortKey, Vec<Value>);

/// Merge `base` and `overlay` into a single stream of rows.
///
/// Both inputs must be sorted by sort key (ties broken by primary
/// key). At each step the smaller head is emitted; on equal keys the
/// overlay entry substitutes for the base row (or suppresses it when
/// tombstoned) and both sides advance.
pub fn merge_scan<B, O>(base: B, overlay: O) -> MergeIter<B::IntoIter, O::IntoIter>
where
    B: IntoIterator<Item = Result<BaseItem>>,
    O: IntoIterator<Item = MergeEntry>,
{
    MergeIter {
        base: base.into_iter(),
        overlay: overlay.into_iter(),
        base_head: None,
        overlay_head: None,
        primed: false,
    }
}

pub struct MergeIter<B, O>
where
    B: Iterator<Item = Result<BaseItem>>,
    O: Iterator<Item = MergeEntry>,
{
    base: B,
    overlay: O,
    base_head: Option<BaseItem>,
    overlay_head: Option<MergeEntry>,
    primed: bool,
}

impl<B, O> MergeIter<B, O>
where
    B: Iterator<Item = Result<BaseItem>>,
    O: Iterator<Item = MergeEntry>,
{
    fn advance_base(&mut self) -> Result<()> {
        self.base_head = match self.base.next() {
            Some(item) => Some(item?),
            None => None,
        };
        Ok(())
    }

    fn advance_overlay(&mut self) {
        self.overlay_head = self.overlay.next();
    }

    fn step(&mut self) -> Result<Option<Vec<Value>>> {
        if !self.primed {
            self.primed = true;
            self.advance_base()?;
            self.advance_overlay();
        }

        loop {
            match (&self.base_head, &self.overlay_head) {
                (None, None) => return Ok(None),
                // Base exhausted: drain overlay, skipping tombstones
                (None, Some(entry)) => {
                    if entry.tombstone {
                        self.advance_overlay();
                        continue;
                    }
                    let row = entry.row.clone();
                    self.advance_overlay();
                    return Ok(Some(row));
                }
                // Overlay exhausted: drain base
                (Some(_), None) => {
                    let (_, _, row) = self
                        .base_head
                        .take()
                        .unwrap_or_else(|| unreachable!("head checked above"));
                    self.advance_base()?;
                    return Ok(Some(row));
                }
                (Some((base_sort, base_pk, _)), Some(entry)) => {
                    let ordering = match base_sort.compare(&entry.sort_key) {
                        Ordering::Equal => base_pk.compare(&entry.pk),
                        non_eq => non_eq,
                    };
                    match ordering {
                        Ordering::Less => {
                            let (_, _, row) = self
                                .base_head
                                .take()
                                .unwrap_or_else(|| unreachable!("head checked above"));
                            self.advance_base()?;
                            return Ok(Some(row));
                        }
                        Ordering::Greater => {
                            if entry.tombstone {
                                self.advance_overlay();
                                continue;
                            }
                            let row = entry.row.clone();
                            self.advance_overlay();
                            return Ok(Some(row));
                        }
                        Ordering::Equal => {
                            // Overlay wins on a primary-key match
                            let tombstone = entry.tombstone;
                            let row = if tombstone {
                                Vec::new()
                            } else {
                                entry.row.clone()
                            };
                            self.advance_base()?;
                            self.advance_overlay();
                            if tombstone {
                                continue;
                            }
                            return Ok(Some(row));
                        }
                    }
                }
            }
        }
    }
}

impl<B, O> Iterator for MergeIter<B, O>
where
    B: Iterator<Item = Result<BaseItem>>,
    O: Iterator<Item = MergeEntry>,
{
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}
