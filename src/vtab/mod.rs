//! # Virtual-Table Contract
//!
//! The boundary between the engine and storage. Every table is backed
//! by a module implementing [`VirtualTableModule`]; an open table is a
//! [`VirtualTable`]; transactional state lives in per-connection
//! [`VirtualTableConnection`] objects enlisted with the transaction
//! coordinator.
//!
//! The planner negotiates access paths through [`IndexInfo`]
//! (`best_index`) and offers whole pipelines through `supports`; an
//! accepted pipeline executes inside the module via `execute_plan`
//! and appears in the plan tree as a `RemoteQuery` node.

pub mod memory;

use crate::error::{QuereusError, Result};
use crate::events::DataChange;
use crate::plan::{ConstraintOp, MutationOp, RelationalPlan};
use crate::schema::{IndexSchema, TableSchema};
use crate::value::{Row, Value};
use std::any::Any;
use std::sync::Arc;

/// Pull-based row stream; dropping the iterator closes the scan
pub type RowIter = Box<dyn Iterator<Item = Result<Row>>>;

/// One predicate offered to a module during planning
#[derive(Debug, Clone)]
pub struct IndexConstraint {
    /// Table column index
    pub column: usize,
    pub op: ConstraintOp,
    /// Whether the engine can supply the comparison value at scan start
    pub usable: bool,
}

/// Module's verdict on one offered constraint
#[derive(Debug, Clone, Default)]
pub struct ConstraintUsage {
    /// Position in the filter argument list, when the module consumes
    /// the constraint
    pub argv_index: Option<usize>,
    /// The engine may skip re-checking the constraint
    pub omit: bool,
}

/// Two-way negotiation record for `best_index`
#[derive(Debug, Clone)]
pub struct IndexInfo {
    // Inputs
    pub constraints: Vec<IndexConstraint>,
    /// Requested output ordering as (column, descending) pairs
    pub order_by: Vec<(usize, bool)>,
    // Outputs
    pub constraint_usage: Vec<ConstraintUsage>,
    /// Chosen secondary index; `None` scans the primary key
    pub index_name: Option<String>,
    pub estimated_cost: f64,
    pub estimated_rows: u64,
    /// The scan already yields rows in the requested order
    pub order_by_consumed: bool,
}

impl IndexInfo {
    pub fn new(constraints: Vec<IndexConstraint>, order_by: Vec<(usize, bool)>) -> Self {
        let usage = vec![ConstraintUsage::default(); constraints.len()];
        IndexInfo {
            constraints,
            order_by,
            constraint_usage: usage,
            index_name: None,
            estimated_cost: f64::MAX,
            estimated_rows: u64::MAX,
            order_by_consumed: false,
        }
    }
}

/// One concrete scan argument: column, operator, value
#[derive(Debug, Clone)]
pub struct FilterArg {
    pub column: usize,
    pub op: ConstraintOp,
    pub value: Value,
}

/// Runtime scan request handed to [`VirtualTable::query`]
#[derive(Debug, Clone, Default)]
pub struct FilterInfo {
    /// Secondary index to scan; `None` scans the primary key
    pub index_name: Option<String>,
    pub args: Vec<FilterArg>,
}

/// A storage module able to create and open tables
pub trait VirtualTableModule: Send + Sync {
    /// DDL-time table creation
    fn create(
        &self,
        schema: &Arc<TableSchema>,
        indexes: &[Arc<IndexSchema>],
    ) -> Result<Arc<dyn VirtualTable>>;

    /// Runtime binding to an existing table
    fn connect(&self, schema: &Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>>;

    /// Pick an access path for the offered constraints and ordering.
    /// The default keeps the primary-key full scan.
    fn best_index(
        &self,
        table: &TableSchema,
        indexes: &[Arc<IndexSchema>],
        info: &mut IndexInfo,
    ) -> Result<()> {
        let _ = (table, indexes, info);
        Ok(())
    }

    /// Probe whether the module will execute `plan` itself. A returned
    /// context is stored in the `RemoteQuery` node and passed back to
    /// [`VirtualTable::execute_plan`].
    fn supports(&self, plan: &Arc<RelationalPlan>) -> Option<Arc<dyn Any + Send + Sync>> {
        let _ = plan;
        None
    }

    /// DDL-time table removal
    fn destroy(&self, schema: &TableSchema) -> Result<()>;
}

/// An open table
pub trait VirtualTable {
    fn schema(&self) -> Arc<TableSchema>;

    /// Scan rows in sort-key order for the chosen access path. When a
    /// connection is supplied, in-transaction mutations must be
    /// visible (read-your-writes).
    fn query(
        &self,
        conn: Option<&dyn VirtualTableConnection>,
        filter: FilterInfo,
    ) -> Result<RowIter>;

    /// Apply one mutation. `new_row` is required for insert/update,
    /// `key_values` (primary-key values of the targeted row) for
    /// update/delete. Returns a storage rowid when the module has one.
    fn update(
        &self,
        conn: Option<&dyn VirtualTableConnection>,
        op: MutationOp,
        new_row: Option<&[Value]>,
        key_values: Option<&[Value]>,
    ) -> Result<Option<i64>>;

    /// Execute a pipeline previously accepted by `supports`
    fn execute_plan(
        &self,
        conn: Option<&dyn VirtualTableConnection>,
        plan: &Arc<RelationalPlan>,
        ctx: &Arc<dyn Any + Send + Sync>,
    ) -> Result<RowIter> {
        let _ = (conn, plan, ctx);
        Err(QuereusError::unsupported(format!(
            "table '{}' does not execute pushed-down plans",
            self.schema().name
        )))
    }

    /// Open a transactional connection onto this table
    fn open_connection(self: Arc<Self>) -> Result<Box<dyn VirtualTableConnection>>;

    /// Catalog notification: a secondary index was added
    fn index_created(&self, index: &Arc<IndexSchema>) -> Result<()> {
        let _ = index;
        Ok(())
    }

    /// Catalog notification: a secondary index was removed
    fn index_dropped(&self, name: &str) -> Result<()> {
        let _ = name;
        Ok(())
    }

    /// Release resources held by the open table
    fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// A transactional handle onto one table. All methods take `&self`;
/// implementations use interior mutability.
pub trait VirtualTableConnection {
    fn connection_id(&self) -> uuid::Uuid;

    fn table_name(&self) -> &str;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn create_savepoint(&self, index: u32) -> Result<()>;

    fn release_savepoint(&self, index: u32) -> Result<()>;

    fn rollback_to_savepoint(&self, index: u32) -> Result<()>;

    /// Drain changes buffered during the just-committed transaction;
    /// called by the coordinator after every participant committed
    fn take_pending_changes(&self) -> Vec<DataChange> {
        Vec::new()
    }

    fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Downcast hook for the owning module
    fn as_any(&self) -> &dyn Any;
}
