//! # Memory Table Module
//!
//! The engine's reference storage module: rows live in a B-tree keyed
//! by the encoded primary key, with one projection per secondary
//! index keyed by `[index key parts…, pk parts…]`.
//!
//! Committed state is an immutable [`TableVersion`] published through
//! `ArcSwap`, so readers scan a pinned snapshot without locks. Writes
//! go through the per-connection [`TransactionOverlay`]; scans merge
//! the overlay with the snapshot for read-your-writes, and commit
//! folds the overlay into a fresh version in one atomic publish.

use super::{
    FilterArg, FilterInfo, IndexInfo, RowIter, VirtualTable, VirtualTableConnection,
    VirtualTableModule,
};
use crate::error::{QuereusError, Result, StatusCode};
use crate::events::DataChange;
use crate::isolation::{merge::merge_scan, MergeEntry, TransactionOverlay};
use crate::plan::{ConstraintOp, MutationOp, RelationalPlan};
use crate::schema::{IndexSchema, TableSchema};
use crate::value::{Collation, Row, SortKey, Value};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Name the module registers under by default
pub const MEMORY_MODULE: &str = "memory";

/// Immutable committed state of one table
#[derive(Debug, Default)]
pub struct TableVersion {
    /// Primary rows keyed by encoded primary key
    rows: BTreeMap<SortKey, Vec<Value>>,
    /// Secondary projections keyed by `[index parts…, pk parts…]`
    indexes: HashMap<String, BTreeMap<SortKey, Vec<Value>>>,
}

/// Factory and registry for in-memory tables
pub struct MemoryTableModule {
    tables: DashMap<String, Arc<MemoryTable>>,
}

impl MemoryTableModule {
    pub fn new() -> Self {
        MemoryTableModule {
            tables: DashMap::new(),
        }
    }

    fn key(schema: &TableSchema) -> String {
        format!(
            "{}.{}",
            schema.schema_name.to_ascii_lowercase(),
            schema.name.to_ascii_lowercase()
        )
    }
}

impl Default for MemoryTableModule {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTableModule for MemoryTableModule {
    fn create(
        &self,
        schema: &Arc<TableSchema>,
        indexes: &[Arc<IndexSchema>],
    ) -> Result<Arc<dyn VirtualTable>> {
        let key = Self::key(schema);
        if self.tables.contains_key(&key) {
            return Err(QuereusError::misuse(format!(
                "memory table '{}' already exists",
                schema.name
            )));
        }
        let table = Arc::new(MemoryTable::new(Arc::clone(schema), indexes.to_vec()));
        self.tables.insert(key, Arc::clone(&table));
        debug!(table = %schema.name, "memory table created");
        Ok(table)
    }

    fn connect(&self, schema: &Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        self.tables
            .get(&Self::key(schema))
            .map(|t| Arc::clone(t.value()) as Arc<dyn VirtualTable>)
            .ok_or_else(|| {
                QuereusError::not_found(format!("no such memory table: {}", schema.name))
            })
    }

    fn best_index(
        &self,
        table: &TableSchema,
        indexes: &[Arc<IndexSchema>],
        info: &mut IndexInfo,
    ) -> Result<()> {
        let base_rows = table.estimated_rows().max(1) as f64;

        // Candidate access paths: the primary key, then each ascending
        // secondary index
        let mut candidates: Vec<(Option<String>, Vec<usize>)> =
            vec![(None, table.primary_key.clone())];
        for index in indexes {
            if index
                .columns
                .iter()
                .all(|(_, order)| *order == crate::schema::SortOrder::Asc)
            {
                let mut cols: Vec<usize> = index.columns.iter().map(|(c, _)| *c).collect();
                cols.extend(table.primary_key.iter().copied());
                candidates.push((Some(index.name.clone()), cols));
            }
        }

        for (index_name, key_columns) in candidates {
            let mut consumed: Vec<usize> = Vec::new();
            let mut rows = base_rows;

            // Leading equality run
            let mut position = 0;
            while position < key_columns.len() {
                let found = info.constraints.iter().position(|c| {
                    c.usable && c.column == key_columns[position] && c.op == ConstraintOp::Eq
                });
                match found {
                    Some(slot) if !consumed.contains(&slot) => {
                        consumed.push(slot);
                        rows /= 10.0;
                        position += 1;
                    }
                    _ => break,
                }
            }
            // A range pair on the next key column
            if position < key_columns.len() {
                for (slot, constraint) in info.constraints.iter().enumerate() {
                    if constraint.usable
                        && constraint.column == key_columns[position]
                        && constraint.op != ConstraintOp::Eq
                        && !consumed.contains(&slot)
                    {
                        consumed.push(slot);
                        rows /= 3.0;
                    }
                }
            }

            let order_consumed = !info.order_by.is_empty()
                && info.order_by.len() <= key_columns.len()
                && info
                    .order_by
                    .iter()
                    .zip(key_columns.iter())
                    .all(|((col, desc), key_col)| !desc && col == key_col);

            let cost = rows.max(1.0) + if index_name.is_some() { 0.5 } else { 0.0 };
            let better = cost < info.estimated_cost
                || (order_consumed && !info.order_by_consumed && cost <= info.estimated_cost);
            if better {
                info.estimated_cost = cost;
                info.estimated_rows = rows.max(1.0) as u64;
                info.index_name = index_name;
                info.order_by_consumed = order_consumed;
                info.constraint_usage = vec![super::ConstraintUsage::default(); info.constraints.len()];
                for (argv, slot) in consumed.iter().enumerate() {
                    info.constraint_usage[*slot].argv_index = Some(argv);
                    info.constraint_usage[*slot].omit = true;
                }
            }
        }
        Ok(())
    }

    fn supports(&self, plan: &Arc<RelationalPlan>) -> Option<Arc<dyn Any + Send + Sync>> {
        // The module executes LIMIT/OFFSET-over-scan pipelines itself
        // when the bounds are literals
        let RelationalPlan::LimitOffset(limit_node) = plan.as_ref() else {
            return None;
        };
        let RelationalPlan::Retrieve(retrieve) = limit_node.source.as_ref() else {
            return None;
        };
        if retrieve.index.is_some() || !retrieve.pushdown.is_empty() {
            return None;
        }
        if !self.tables.contains_key(&Self::key(&retrieve.table_ref.table)) {
            return None;
        }
        let literal = |expr: &Option<crate::plan::ScalarPlan>| match expr {
            None => Some(None),
            Some(crate::plan::ScalarPlan::Literal { value }) => value.as_integer().map(Some),
            Some(_) => None,
        };
        let limit = literal(&limit_node.limit)?;
        let offset = literal(&limit_node.offset)?;
        Some(Arc::new(LimitPushdown { limit, offset }))
    }

    fn destroy(&self, schema: &TableSchema) -> Result<()> {
        self.tables.remove(&Self::key(schema));
        Ok(())
    }
}

/// Context for an accepted LIMIT/OFFSET push-down
#[derive(Debug, Clone, Copy)]
pub struct LimitPushdown {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// One in-memory table
pub struct MemoryTable {
    schema: Arc<TableSchema>,
    committed: ArcSwap<TableVersion>,
    indexes: RwLock<Vec<Arc<IndexSchema>>>,
}

impl MemoryTable {
    pub fn new(schema: Arc<TableSchema>, indexes: Vec<Arc<IndexSchema>>) -> Self {
        let mut version = TableVersion::default();
        for index in &indexes {
            version.indexes.insert(index.name.clone(), BTreeMap::new());
        }
        MemoryTable {
            schema,
            committed: ArcSwap::from_pointee(version),
            indexes: RwLock::new(indexes),
        }
    }

    /// Encode the primary key of a row, folding collations
    fn pk_key(&self, row: &[Value]) -> Result<SortKey> {
        pk_key_of(&self.schema, row)
    }

    /// Encode primary-key values supplied by the executor
    fn pk_key_from_values(&self, key_values: &[Value]) -> Result<SortKey> {
        if key_values.len() != self.schema.primary_key.len() {
            return Err(QuereusError::internal(format!(
                "expected {} key values for '{}', got {}",
                self.schema.primary_key.len(),
                self.schema.name,
                key_values.len()
            )));
        }
        let parts = self
            .schema
            .primary_key
            .iter()
            .zip(key_values.iter())
            .map(|(&col, value)| {
                let collation =
                    self.schema.column(col).map_or(Collation::Binary, |c| c.collation);
                value.collate_key(collation)
            })
            .collect();
        Ok(SortKey::new(parts))
    }

    /// Encode a row's position in one secondary index
    fn index_key(&self, index: &IndexSchema, row: &[Value]) -> Result<SortKey> {
        let mut parts = Vec::with_capacity(index.columns.len() + self.schema.primary_key.len());
        for (col, _) in &index.columns {
            let value = row.get(*col).ok_or_else(|| {
                QuereusError::internal(format!(
                    "row too short for index '{}' of '{}'",
                    index.name, self.schema.name
                ))
            })?;
            let collation = self.schema.column(*col).map_or(Collation::Binary, |c| c.collation);
            parts.push(value.collate_key(collation));
        }
        Ok(SortKey::new(parts).concat(&self.pk_key(row)?))
    }

    fn key_columns(&self, index: Option<&IndexSchema>) -> Vec<usize> {
        match index {
            None => self.schema.primary_key.clone(),
            Some(index) => {
                let mut cols: Vec<usize> = index.columns.iter().map(|(c, _)| *c).collect();
                cols.extend(self.schema.primary_key.iter().copied());
                cols
            }
        }
    }

    fn find_index(&self, name: &str) -> Result<Arc<IndexSchema>> {
        self.indexes
            .read()
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| QuereusError::not_found(format!("no such index: {name}")))
    }

    /// Row currently visible for a primary key: overlay first, then the
    /// committed snapshot
    fn visible_row(
        &self,
        overlay: Option<&TransactionOverlay>,
        pk: &SortKey,
    ) -> Option<Vec<Value>> {
        if let Some(overlay) = overlay {
            if let Some(verdict) = overlay.visible(pk) {
                return verdict;
            }
        }
        self.committed.load().rows.get(pk).cloned()
    }

    /// Overlay entries (primary plus per-index projections) for one
    /// mutation
    fn overlay_entries(
        &self,
        old_row: Option<&[Value]>,
        new_row: Option<&[Value]>,
        pk_old: Option<&SortKey>,
        pk_new: Option<&SortKey>,
    ) -> Result<(Vec<MergeEntry>, Vec<(String, MergeEntry)>)> {
        let mut primary = Vec::new();
        let mut per_index = Vec::new();

        match (pk_old, pk_new) {
            // Insert
            (None, Some(new_pk)) => {
                let row = new_row.unwrap_or_default().to_vec();
                primary.push(MergeEntry::upsert(row, new_pk.clone(), new_pk.clone()));
            }
            // Delete
            (Some(old_pk), None) => {
                primary.push(MergeEntry::tombstone(old_pk.clone(), old_pk.clone()));
            }
            // Update
            (Some(old_pk), Some(new_pk)) => {
                if old_pk != new_pk {
                    primary.push(MergeEntry::tombstone(old_pk.clone(), old_pk.clone()));
                }
                let row = new_row.unwrap_or_default().to_vec();
                primary.push(MergeEntry::upsert(row, new_pk.clone(), new_pk.clone()));
            }
            (None, None) => {
                return Err(QuereusError::internal("mutation without old or new key"))
            }
        }

        for index in self.indexes.read().iter() {
            let old_key = match (old_row, pk_old) {
                (Some(row), Some(_)) => Some(self.index_key(index, row)?),
                _ => None,
            };
            let new_key = match (new_row, pk_new) {
                (Some(row), Some(_)) => Some(self.index_key(index, row)?),
                _ => None,
            };
            match (old_key, new_key) {
                (Some(old_key), Some(new_key)) if old_key == new_key => {
                    let row = new_row.unwrap_or_default().to_vec();
                    let pk = pk_new.cloned().unwrap_or_default();
                    per_index.push((index.name.clone(), MergeEntry::upsert(row, pk, new_key)));
                }
                (old_key, new_key) => {
                    if let Some(old_key) = old_key {
                        let pk = pk_old.cloned().unwrap_or_default();
                        per_index
                            .push((index.name.clone(), MergeEntry::tombstone(pk, old_key)));
                    }
                    if let Some(new_key) = new_key {
                        let row = new_row.unwrap_or_default().to_vec();
                        let pk = pk_new.cloned().unwrap_or_default();
                        per_index.push((index.name.clone(), MergeEntry::upsert(row, pk, new_key)));
                    }
                }
            }
        }
        Ok((primary, per_index))
    }

    fn memory_conn<'a>(
        conn: Option<&'a dyn VirtualTableConnection>,
    ) -> Result<Option<&'a MemoryTableConnection>> {
        match conn {
            None => Ok(None),
            Some(conn) => conn
                .as_any()
                .downcast_ref::<MemoryTableConnection>()
                .map(Some)
                .ok_or_else(|| {
                    QuereusError::new(
                        StatusCode::Mismatch,
                        "connection does not belong to the memory module",
                    )
                }),
        }
    }
}

/// Bounds and residual predicate derived from a [`FilterInfo`]
struct ScanWindow {
    /// First key the scan may produce
    start: Option<SortKey>,
    /// Leading equality prefix the key must match
    eq_prefix: Vec<Value>,
    /// Upper stop bound on the key part after the prefix
    stop_above: Option<Value>,
    /// Residual per-row checks (column, op, value, collation)
    checks: Vec<(usize, ConstraintOp, Value, Collation)>,
}

impl ScanWindow {
    fn build(schema: &TableSchema, key_columns: &[usize], args: &[FilterArg]) -> Self {
        let collation_of = |col: usize| {
            schema
                .column(col)
                .map_or(Collation::Binary, |c| c.collation)
        };

        let mut eq_prefix = Vec::new();
        let mut used: Vec<usize> = Vec::new();
        let mut position = 0;
        while position < key_columns.len() {
            let found = args.iter().enumerate().find(|(slot, a)| {
                a.column == key_columns[position] && a.op == ConstraintOp::Eq && !used.contains(slot)
            });
            match found {
                Some((slot, arg)) => {
                    eq_prefix.push(arg.value.collate_key(collation_of(arg.column)));
                    used.push(slot);
                    position += 1;
                }
                None => break,
            }
        }

        let mut lower: Option<Value> = None;
        let mut stop_above: Option<Value> = None;
        if position < key_columns.len() {
            for (slot, arg) in args.iter().enumerate() {
                if used.contains(&slot) || arg.column != key_columns[position] {
                    continue;
                }
                let folded = arg.value.collate_key(collation_of(arg.column));
                match arg.op {
                    ConstraintOp::Gt | ConstraintOp::Ge => lower = Some(folded),
                    ConstraintOp::Lt | ConstraintOp::Le => stop_above = Some(folded),
                    ConstraintOp::Eq => {}
                }
            }
        }

        let start = if eq_prefix.is_empty() && lower.is_none() {
            None
        } else {
            let mut parts = eq_prefix.clone();
            if let Some(lower) = lower {
                parts.push(lower);
            }
            Some(SortKey::new(parts))
        };

        let checks = args
            .iter()
            .map(|a| (a.column, a.op, a.value.clone(), collation_of(a.column)))
            .collect();

        ScanWindow {
            start,
            eq_prefix,
            stop_above,
            checks,
        }
    }

    /// Whether the scan can stop at this key (sorted input)
    fn past_end(&self, key: &SortKey) -> bool {
        for (i, want) in self.eq_prefix.iter().enumerate() {
            match key.parts().get(i) {
                Some(part) => match Value::compare(part, want, Collation::Binary) {
                    std::cmp::Ordering::Equal => {}
                    std::cmp::Ordering::Greater => return true,
                    std::cmp::Ordering::Less => return false,
                },
                None => return false,
            }
        }
        if let Some(stop) = &self.stop_above {
            if let Some(part) = key.parts().get(self.eq_prefix.len()) {
                if Value::compare(part, stop, Collation::Binary) == std::cmp::Ordering::Greater {
                    return true;
                }
            }
        }
        false
    }

    /// Key-range check for overlay entries (no row image required)
    fn key_in_range(&self, key: &SortKey) -> bool {
        if self.past_end(key) {
            return false;
        }
        if let Some(start) = &self.start {
            // Compare only up to the start key's own length: longer keys
            // sharing the prefix are inside the window
            let len = start.len().min(key.len());
            let head = SortKey::new(key.parts()[..len].to_vec());
            let bound = SortKey::new(start.parts()[..len].to_vec());
            if head < bound {
                return false;
            }
        }
        true
    }

    /// Full residual check against the row image
    fn row_passes(&self, row: &[Value]) -> bool {
        self.checks.iter().all(|(col, op, want, collation)| {
            let Some(have) = row.get(*col) else {
                return false;
            };
            match Value::sql_cmp(have, want, *collation) {
                None => false,
                Some(ordering) => match op {
                    ConstraintOp::Eq => ordering == std::cmp::Ordering::Equal,
                    ConstraintOp::Lt => ordering == std::cmp::Ordering::Less,
                    ConstraintOp::Le => ordering != std::cmp::Ordering::Greater,
                    ConstraintOp::Gt => ordering == std::cmp::Ordering::Greater,
                    ConstraintOp::Ge => ordering != std::cmp::Ordering::Less,
                },
            }
        })
    }
}

/// Streaming cursor over a pinned snapshot, O(log n) per step
struct SnapshotCursor {
    version: Arc<TableVersion>,
    index: Option<String>,
    schema: Arc<TableSchema>,
    window: ScanWindow,
    next_from: Bound<SortKey>,
    done: bool,
}

impl Iterator for SnapshotCursor {
    type Item = Result<(SortKey, SortKey, Vec<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let entry = {
                let map = match &self.index {
                    None => &self.version.rows,
                    Some(name) => match self.version.indexes.get(name) {
                        Some(map) => map,
                        None => {
                            self.done = true;
                            return Some(Err(QuereusError::internal(format!(
                                "missing index projection '{name}'"
                            ))));
                        }
                    },
                };
                map.range((self.next_from.clone(), Bound::Unbounded))
                    .next()
                    .map(|(k, v)| (k.clone(), v.clone()))
            };
            let Some((key, row)) = entry else {
                self.done = true;
                return None;
            };
            self.next_from = Bound::Excluded(key.clone());
            if self.window.past_end(&key) {
                self.done = true;
                return None;
            }
            if !self.window.row_passes(&row) {
                continue;
            }
            let pk = match pk_key_of(&self.schema, &row) {
                Ok(pk) => pk,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            return Some(Ok((key, pk, row)));
        }
    }
}

impl VirtualTable for MemoryTable {
    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema)
    }

    fn query(
        &self,
        conn: Option<&dyn VirtualTableConnection>,
        filter: FilterInfo,
    ) -> Result<RowIter> {
        let index = match &filter.index_name {
            Some(name) => Some(self.find_index(name)?),
            None => None,
        };
        let key_columns = self.key_columns(index.as_deref());
        let window = ScanWindow::build(&self.schema, &key_columns, &filter.args);
        let start = window
            .start
            .clone()
            .map_or(Bound::Unbounded, Bound::Included);

        let base = SnapshotCursor {
            version: self.committed.load_full(),
            index: filter.index_name.clone(),
            schema: Arc::clone(&self.schema),
            window,
            next_from: start,
            done: false,
        };

        // Overlay entries within the window, already in sort-key order
        let overlay_entries: Vec<MergeEntry> = match Self::memory_conn(conn)? {
            Some(mc) => {
                let state = mc.state.lock();
                if state.overlay.is_active() {
                    let window = ScanWindow::build(&self.schema, &key_columns, &filter.args);
                    let effective = match &filter.index_name {
                        None => state.overlay.effective_primary(),
                        Some(name) => state.overlay.effective_index(name),
                    };
                    effective
                        .into_values()
                        .filter(|entry| {
                            window.key_in_range(&entry.sort_key)
                                && (entry.tombstone || window.row_passes(&entry.row))
                        })
                        .collect()
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };

        let merged = merge_scan(base, overlay_entries).map(|item| item.map(Row::new));
        Ok(Box::new(merged))
    }

    fn update(
        &self,
        conn: Option<&dyn VirtualTableConnection>,
        op: MutationOp,
        new_row: Option<&[Value]>,
        key_values: Option<&[Value]>,
    ) -> Result<Option<i64>> {
        if self.schema.read_only {
            return Err(QuereusError::new(
                StatusCode::ReadOnly,
                format!("table '{}' is read-only", self.schema.name),
            ));
        }
        let Some(mc) = Self::memory_conn(conn)? else {
            return Err(QuereusError::misuse(
                "memory table writes require an open transaction connection",
            ));
        };
        let mut state = mc.state.lock();
        if !state.overlay.is_active() {
            return Err(QuereusError::misuse(
                "memory table writes require an open transaction",
            ));
        }

        match op {
            MutationOp::Insert => {
                let row = new_row.ok_or_else(|| {
                    QuereusError::internal("insert without a row image")
                })?;
                if row.len() != self.schema.columns.len() {
                    return Err(QuereusError::mismatch(format!(
                        "table '{}' expects {} values, got {}",
                        self.schema.name,
                        self.schema.columns.len(),
                        row.len()
                    )));
                }
                let pk = self.pk_key(row)?;
                if self.visible_row(Some(&state.overlay), &pk).is_some() {
                    return Err(QuereusError::constraint(format!(
                        "UNIQUE constraint failed: duplicate primary key in '{}'",
                        self.schema.name
                    )));
                }
                let (primary, per_index) =
                    self.overlay_entries(None, Some(row), None, Some(&pk))?;
                for entry in primary {
                    state.overlay.record(entry, Vec::new());
                }
                state.overlay.record_index_entries(per_index);
                state.pending.push(DataChange {
                    op,
                    schema: self.schema.schema_name.clone(),
                    table: self.schema.name.clone(),
                    old_row: None,
                    new_row: Some(row.to_vec()),
                    remote: false,
                });
            }
            MutationOp::Update => {
                let row = new_row.ok_or_else(|| {
                    QuereusError::internal("update without a row image")
                })?;
                let keys = key_values.ok_or_else(|| {
                    QuereusError::internal("update without key values")
                })?;
                let old_pk = self.pk_key_from_values(keys)?;
                let old_row = self
                    .visible_row(Some(&state.overlay), &old_pk)
                    .ok_or_else(|| {
                        QuereusError::not_found(format!(
                            "row to update not found in '{}'",
                            self.schema.name
                        ))
                    })?;
                let new_pk = self.pk_key(row)?;
                if new_pk != old_pk && self.visible_row(Some(&state.overlay), &new_pk).is_some() {
                    return Err(QuereusError::constraint(format!(
                        "UNIQUE constraint failed: duplicate primary key in '{}'",
                        self.schema.name
                    )));
                }
                let (primary, per_index) =
                    self.overlay_entries(Some(&old_row), Some(row), Some(&old_pk), Some(&new_pk))?;
                for entry in primary {
                    state.overlay.record(entry, Vec::new());
                }
                state.overlay.record_index_entries(per_index);
                state.pending.push(DataChange {
                    op,
                    schema: self.schema.schema_name.clone(),
                    table: self.schema.name.clone(),
                    old_row: Some(old_row),
                    new_row: Some(row.to_vec()),
                    remote: false,
                });
            }
            MutationOp::Delete => {
                let keys = key_values.ok_or_else(|| {
                    QuereusError::internal("delete without key values")
                })?;
                let pk = self.pk_key_from_values(keys)?;
                let Some(old_row) = self.visible_row(Some(&state.overlay), &pk) else {
                    // Already gone within this transaction
                    return Ok(None);
                };
                let (primary, per_index) =
                    self.overlay_entries(Some(&old_row), None, Some(&pk), None)?;
                for entry in primary {
                    state.overlay.record(entry, Vec::new());
                }
                state.overlay.record_index_entries(per_index);
                state.pending.push(DataChange {
                    op,
                    schema: self.schema.schema_name.clone(),
                    table: self.schema.name.clone(),
                    old_row: Some(old_row),
                    new_row: None,
                    remote: false,
                });
            }
        }
        Ok(None)
    }

    fn execute_plan(
        &self,
        conn: Option<&dyn VirtualTableConnection>,
        _plan: &Arc<RelationalPlan>,
        ctx: &Arc<dyn Any + Send + Sync>,
    ) -> Result<RowIter> {
        let pushdown = ctx
            .downcast_ref::<LimitPushdown>()
            .ok_or_else(|| QuereusError::internal("foreign push-down context"))?;
        let rows = self.query(conn, FilterInfo::default())?;
        let offset = pushdown.offset.unwrap_or(0).max(0) as usize;
        let limited: RowIter = match pushdown.limit {
            Some(limit) => Box::new(rows.skip(offset).take(limit.max(0) as usize)),
            None => Box::new(rows.skip(offset)),
        };
        Ok(limited)
    }

    fn open_connection(self: Arc<Self>) -> Result<Box<dyn VirtualTableConnection>> {
        Ok(Box::new(MemoryTableConnection {
            id: Uuid::new_v4(),
            table: self,
            state: Mutex::new(ConnState::default()),
        }))
    }

    fn index_created(&self, index: &Arc<IndexSchema>) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes.iter().any(|i| i.name == index.name) {
            return Ok(());
        }
        indexes.push(Arc::clone(index));
        drop(indexes);

        // Rebuild the projection from committed rows and publish
        let current = self.committed.load_full();
        let mut projection = BTreeMap::new();
        for row in current.rows.values() {
            projection.insert(self.index_key(index, row)?, row.clone());
        }
        let mut next = TableVersion {
            rows: current.rows.clone(),
            indexes: current.indexes.clone(),
        };
        next.indexes.insert(index.name.clone(), projection);
        self.committed.store(Arc::new(next));
        Ok(())
    }

    fn index_dropped(&self, name: &str) -> Result<()> {
        self.indexes.write().retain(|i| !i.name.eq_ignore_ascii_case(name));
        let current = self.committed.load_full();
        let mut next = TableVersion {
            rows: current.rows.clone(),
            indexes: current.indexes.clone(),
        };
        next.indexes.remove(name);
        self.committed.store(Arc::new(next));
        Ok(())
    }
}

/// Encode the primary key of a row, folding collations
fn pk_key_of(schema: &TableSchema, row: &[Value]) -> Result<SortKey> {
    let mut parts = Vec::with_capacity(schema.primary_key.len());
    for &col in &schema.primary_key {
        let value = row.get(col).ok_or_else(|| {
            QuereusError::internal(format!("row too short for pk of '{}'", schema.name))
        })?;
        let collation = schema.column(col).map_or(Collation::Binary, |c| c.collation);
        parts.push(value.collate_key(collation));
    }
    Ok(SortKey::new(parts))
}

#[derive(Default)]
struct ConnState {
    overlay: TransactionOverlay,
    savepoint_depths: HashMap<u32, usize>,
    pending: Vec<DataChange>,
}

/// Transactional handle onto a [`MemoryTable`]
pub struct MemoryTableConnection {
    id: Uuid,
    table: Arc<MemoryTable>,
    state: Mutex<ConnState>,
}

impl VirtualTableConnection for MemoryTableConnection {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn table_name(&self) -> &str {
        &self.table.schema.name
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.overlay.is_active() {
            return Err(QuereusError::misuse("connection already in a transaction"));
        }
        state.overlay.begin();
        state.savepoint_depths.clear();
        state.pending.clear();
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.overlay.is_active() {
            return Ok(());
        }

        let primary = state.overlay.effective_primary();
        let current = self.table.committed.load_full();
        let mut rows = current.rows.clone();
        for (pk, entry) in &primary {
            if entry.tombstone {
                rows.remove(pk);
            } else {
                rows.insert(pk.clone(), entry.row.clone());
            }
        }

        let mut indexes = HashMap::new();
        for index in self.table.indexes.read().iter() {
            let mut projection = current
                .indexes
                .get(&index.name)
                .cloned()
                .unwrap_or_default();
            for (key, entry) in state.overlay.effective_index(&index.name) {
                if entry.tombstone {
                    projection.remove(&key);
                } else {
                    projection.insert(key, entry.row.clone());
                }
            }
            indexes.insert(index.name.clone(), projection);
        }

        self.table.schema.set_estimated_rows(rows.len() as u64);
        self.table
            .committed
            .store(Arc::new(TableVersion { rows, indexes }));
        state.overlay.clear();
        state.savepoint_depths.clear();
        debug!(table = %self.table.schema.name, "overlay flushed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.overlay.clear();
        state.savepoint_depths.clear();
        state.pending.clear();
        Ok(())
    }

    fn create_savepoint(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        if !state.overlay.is_active() {
            return Err(QuereusError::misuse("savepoint outside a transaction"));
        }
        let depth = state.overlay.push_layer();
        state.savepoint_depths.insert(index, depth);
        Ok(())
    }

    fn release_savepoint(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        let Some(depth) = state.savepoint_depths.remove(&index) else {
            return Err(QuereusError::not_found(format!("no such savepoint: {index}")));
        };
        state.overlay.merge_down(depth);
        state.savepoint_depths.retain(|_, d| *d < depth);
        Ok(())
    }

    fn rollback_to_savepoint(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        let Some(&depth) = state.savepoint_depths.get(&index) else {
            return Err(QuereusError::not_found(format!("no such savepoint: {index}")));
        };
        state.overlay.truncate(depth);
        let fresh = state.overlay.push_layer();
        state.savepoint_depths.retain(|_, d| *d < depth);
        state.savepoint_depths.insert(index, fresh);
        Ok(())
    }

    fn take_pending_changes(&self) -> Vec<DataChange> {
        std::mem::take(&mut self.state.lock().pending)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, SortOrder};
    use crate::IndexConstraint;

    fn users_schema() -> Arc<TableSchema> {
        let mut id = ColumnSchema::new("id", "INTEGER");
        id.not_null = true;
        let name = ColumnSchema::new("name", "TEXT");
        Arc::new(TableSchema::new("users", MEMORY_MODULE, vec![id, name], vec![0]))
    }

    fn row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Integer(id), Value::Text(name.into())]
    }

    fn scan(
        table: &Arc<dyn VirtualTable>,
        conn: Option<&dyn VirtualTableConnection>,
    ) -> Vec<Vec<Value>> {
        table
            .query(conn, FilterInfo::default())
            .expect("query")
            .map(|r| r.map(Row::into_values))
            .collect::<Result<Vec<_>>>()
            .expect("rows")
    }

    fn setup() -> (Arc<dyn VirtualTable>, Box<dyn VirtualTableConnection>) {
        let module = MemoryTableModule::new();
        let table = module.create(&users_schema(), &[]).expect("create");
        let conn = Arc::clone(&table).open_connection().expect("conn");
        (table, conn)
    }

    #[test]
    fn test_read_your_writes_and_commit_visibility() {
        let (table, conn) = setup();
        conn.begin().expect("begin");
        table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "a")), None)
            .expect("insert");

        // Visible through the writing connection, not to bare readers
        assert_eq!(scan(&table, Some(conn.as_ref())).len(), 1);
        assert_eq!(scan(&table, None).len(), 0);

        conn.commit().expect("commit");
        assert_eq!(scan(&table, None).len(), 1);
    }

    #[test]
    fn test_rollback_discards_overlay() {
        let (table, conn) = setup();
        conn.begin().expect("begin");
        table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "a")), None)
            .expect("insert");
        conn.rollback().expect("rollback");
        assert_eq!(scan(&table, None).len(), 0);
        assert!(conn.take_pending_changes().is_empty());
    }

    #[test]
    fn test_delete_hides_row_in_transaction() {
        let (table, conn) = setup();
        conn.begin().expect("begin");
        table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "a")), None)
            .expect("insert");
        conn.commit().expect("commit");

        conn.begin().expect("begin 2");
        table
            .update(
                Some(conn.as_ref()),
                MutationOp::Delete,
                None,
                Some(&[Value::Integer(1)]),
            )
            .expect("delete");
        assert_eq!(scan(&table, Some(conn.as_ref())).len(), 0);
        conn.commit().expect("commit 2");
        assert_eq!(scan(&table, None).len(), 0);
    }

    #[test]
    fn test_update_sees_new_value_once() {
        let (table, conn) = setup();
        conn.begin().expect("begin");
        table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "a")), None)
            .expect("insert");
        table
            .update(
                Some(conn.as_ref()),
                MutationOp::Update,
                Some(&row(1, "A")),
                Some(&[Value::Integer(1)]),
            )
            .expect("update");
        let rows = scan(&table, Some(conn.as_ref()));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], Value::Text("A".into()));
    }

    #[test]
    fn test_duplicate_pk_is_a_constraint_error() {
        let (table, conn) = setup();
        conn.begin().expect("begin");
        table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "a")), None)
            .expect("insert");
        let err = table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "b")), None)
            .expect_err("duplicate");
        assert_eq!(err.code, StatusCode::Constraint);
    }

    #[test]
    fn test_write_without_transaction_is_misuse() {
        let (table, conn) = setup();
        let err = table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "a")), None)
            .expect_err("no txn");
        assert_eq!(err.code, StatusCode::Misuse);
    }

    #[test]
    fn test_savepoint_rollback_within_connection() {
        let (table, conn) = setup();
        conn.begin().expect("begin");
        table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(1, "x")), None)
            .expect("insert 1");
        conn.create_savepoint(0).expect("sp");
        table
            .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(2, "y")), None)
            .expect("insert 2");
        conn.rollback_to_savepoint(0).expect("rollback to");
        conn.commit().expect("commit");
        let rows = scan(&table, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Integer(1));
    }

    #[test]
    fn test_pk_range_scan() {
        let (table, conn) = setup();
        conn.begin().expect("begin");
        for i in 1..=5 {
            table
                .update(
                    Some(conn.as_ref()),
                    MutationOp::Insert,
                    Some(&row(i, "r")),
                    None,
                )
                .expect("insert");
        }
        conn.commit().expect("commit");

        let filter = FilterInfo {
            index_name: None,
            args: vec![
                FilterArg {
                    column: 0,
                    op: ConstraintOp::Ge,
                    value: Value::Integer(2),
                },
                FilterArg {
                    column: 0,
                    op: ConstraintOp::Lt,
                    value: Value::Integer(5),
                },
            ],
        };
        let rows: Vec<Row> = table
            .query(None, filter)
            .expect("query")
            .collect::<Result<Vec<_>>>()
            .expect("rows");
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| match r.get(0) {
                Some(Value::Integer(i)) => *i,
                other => panic!("bad id: {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_secondary_index_scan_order() {
        let module = MemoryTableModule::new();
        let schema = users_schema();
        let index = Arc::new(IndexSchema {
            name: "users_name".into(),
            table_name: "users".into(),
            columns: vec![(1, SortOrder::Asc)],
            unique: false,
        });
        let table = module.create(&schema, &[Arc::clone(&index)]).expect("create");
        let conn = Arc::clone(&table).open_connection().expect("conn");
        conn.begin().expect("begin");
        for (id, name) in [(1, "zeta"), (2, "alpha"), (3, "mid")] {
            table
                .update(Some(conn.as_ref()), MutationOp::Insert, Some(&row(id, name)), None)
                .expect("insert");
        }
        conn.commit().expect("commit");

        let filter = FilterInfo {
            index_name: Some("users_name".into()),
            args: vec![],
        };
        let rows: Vec<Row> = table
            .query(None, filter)
            .expect("query")
            .collect::<Result<Vec<_>>>()
            .expect("rows");
        let names: Vec<String> = rows
            .iter()
            .map(|r| match r.get(1) {
                Some(Value::Text(s)) => s.clone(),
                other => panic!("bad name: {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_best_index_consumes_pk_equality() {
        let module = MemoryTableModule::new();
        let schema = users_schema();
        let mut info = IndexInfo::new(
            vec![IndexConstraint {
                column: 0,
                op: ConstraintOp::Eq,
                usable: true,
            }],
            vec![],
        );
        module.best_index(&schema, &[], &mut info).expect("best_index");
        assert!(info.index_name.is_none());
        assert_eq!(info.constraint_usage[0].argv_index, Some(0));
        assert!(info.constraint_usage[0].omit);
    }

    #[test]
    fn test_limit_pushdown_support() {
        use crate::plan::{
            next_plan_node_id, LimitOffsetNode, RetrieveNode, ScalarPlan, TableRef,
        };

        let module = MemoryTableModule::new();
        let schema = users_schema();
        module.create(&schema, &[]).expect("create");

        let retrieve_id = next_plan_node_id();
        let attributes: Vec<crate::plan::Attribute> = Vec::new();
        let retrieve = Arc::new(RelationalPlan::Retrieve(RetrieveNode {
            id: retrieve_id,
            table_ref: TableRef {
                table: Arc::clone(&schema),
                binding: "users".into(),
            },
            index: None,
            pushdown: vec![],
            relation_type: crate::plan::RelationType::from_attributes(&attributes),
            attributes,
        }));
        let plan = Arc::new(RelationalPlan::LimitOffset(LimitOffsetNode {
            id: next_plan_node_id(),
            attributes: retrieve.attributes().to_vec(),
            source: retrieve,
            limit: Some(ScalarPlan::literal(Value::Integer(2))),
            offset: None,
        }));
        let ctx = module.supports(&plan).expect("supported");
        assert!(ctx.downcast_ref::<LimitPushdown>().is_some());
    }
}
