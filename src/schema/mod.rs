//! # Schema Catalog
//!
//! Descriptions of tables, columns, indexes, functions, and views, plus
//! the [`SchemaManager`] that stores them. Schema objects are immutable
//! once registered and shared as `Arc`s; the emitter captures those
//! `Arc`s and the runtime re-validates them by pointer identity before
//! executing, so a DDL change between emission and execution surfaces
//! as `SCHEMA_CHANGED` instead of a stale read.

mod manager;

pub use manager::{SchemaChange, SchemaManager};

use crate::error::{QuereusError, Result};
use crate::value::{Collation, TypeAffinity, Value};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default row-count estimate for tables that have never been analyzed
pub const DEFAULT_ROW_ESTIMATE: u64 = 1000;

/// A single column of a table
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Declared type text as written in the DDL (may be empty)
    pub declared_type: String,
    pub affinity: TypeAffinity,
    pub not_null: bool,
    pub collation: Collation,
    /// Literal default applied when an INSERT omits the column
    pub default_value: Option<Value>,
    /// Hidden columns are skipped by `SELECT *`
    pub hidden: bool,
    /// Generated columns are computed by the module, not writable
    pub generated: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        let declared_type = declared_type.into();
        let affinity = TypeAffinity::from_declared_type(&declared_type);
        ColumnSchema {
            name: name.into(),
            declared_type,
            affinity,
            not_null: false,
            collation: Collation::Binary,
            default_value: None,
            hidden: false,
            generated: false,
        }
    }
}

/// A table-level CHECK constraint, stored as SQL source and compiled by
/// the planner when it builds the constraint-check node
#[derive(Debug, Clone, Serialize)]
pub struct CheckConstraint {
    pub name: Option<String>,
    pub expr_sql: String,
}

/// A table registered in the catalog, bound to a virtual-table module
#[derive(Debug, Serialize)]
pub struct TableSchema {
    /// Owning schema namespace; `main` unless the host says otherwise
    pub schema_name: String,
    pub name: String,
    /// Virtual-table module implementing this table
    pub module_name: String,
    /// Module arguments from `USING module(args...)`
    pub module_args: Vec<String>,
    pub columns: Vec<ColumnSchema>,
    /// Primary-key column indices, in key order
    pub primary_key: Vec<usize>,
    pub checks: Vec<CheckConstraint>,
    pub read_only: bool,
    /// Cardinality hint refreshed by ANALYZE
    #[serde(skip)]
    estimated_rows: AtomicU64,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        module_name: impl Into<String>,
        columns: Vec<ColumnSchema>,
        primary_key: Vec<usize>,
    ) -> Self {
        TableSchema {
            schema_name: "main".to_string(),
            name: name.into(),
            module_name: module_name.into(),
            module_args: Vec::new(),
            columns,
            primary_key,
            checks: Vec::new(),
            read_only: false,
            estimated_rows: AtomicU64::new(DEFAULT_ROW_ESTIMATE),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, index: usize) -> Option<&ColumnSchema> {
        self.columns.get(index)
    }

    /// Whether the column at `index` is part of the primary key
    pub fn is_pk_column(&self, index: usize) -> bool {
        self.primary_key.contains(&index)
    }

    /// Extract the primary-key values of a row, in key order
    pub fn pk_values(&self, row: &[Value]) -> Result<Vec<Value>> {
        self.primary_key
            .iter()
            .map(|&i| {
                row.get(i).cloned().ok_or_else(|| {
                    QuereusError::internal(format!(
                        "row too short for primary key of '{}'",
                        self.name
                    ))
                })
            })
            .collect()
    }

    pub fn estimated_rows(&self) -> u64 {
        self.estimated_rows.load(Ordering::Relaxed)
    }

    pub fn set_estimated_rows(&self, rows: u64) {
        self.estimated_rows.store(rows, Ordering::Relaxed);
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.name)
    }
}

/// Sort direction of an index column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A secondary index over a table
#[derive(Debug, Clone, Serialize)]
pub struct IndexSchema {
    pub name: String,
    pub table_name: String,
    /// (column index, direction) pairs in key order
    pub columns: Vec<(usize, SortOrder)>,
    pub unique: bool,
}

/// A named view, stored as its defining SQL and re-planned at each use
#[derive(Debug, Clone, Serialize)]
pub struct ViewSchema {
    pub schema_name: String,
    pub name: String,
    pub sql: String,
    pub column_names: Option<Vec<String>>,
}

/// Kinds of registered functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Scalar,
}

/// Implementation of a scalar function
pub type ScalarFunc = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// A scalar function registered in the catalog
#[derive(Clone)]
pub struct FunctionSchema {
    pub name: String,
    /// Exact argument count, or `None` for variadic
    pub arity: Option<usize>,
    pub kind: FunctionKind,
    pub deterministic: bool,
    pub func: ScalarFunc,
}

impl FunctionSchema {
    pub fn scalar(
        name: impl Into<String>,
        arity: Option<usize>,
        func: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        FunctionSchema {
            name: name.into(),
            arity,
            kind: FunctionKind::Scalar,
            deterministic: true,
            func: Arc::new(func),
        }
    }

    /// Whether this function accepts `argc` arguments
    pub fn accepts(&self, argc: usize) -> bool {
        self.arity.map_or(true, |a| a == argc)
    }
}

impl fmt::Debug for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSchema")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("kind", &self.kind)
            .field("deterministic", &self.deterministic)
            .finish_non_exhaustive()
    }
}
