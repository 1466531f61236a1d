//! # Quereus SQL Engine
//!
//! An embeddable SQL engine organized around a three-stage pipeline:
//! a parser produces an AST, a planner builds a tree of typed plan
//! nodes, and an emitter lowers the plan into an instruction graph a
//! scheduler executes. Every table is a virtual table (a pluggable
//! module over an arbitrary store) with an isolation layer providing
//! read-your-writes and snapshot-style semantics via an overlay/merge
//! iterator, and a coordinator spanning one logical transaction across
//! every table a statement program touches.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! SQL Source Text
//!     ↓
//! [Parser]               → AST
//!     ↓
//! [Planner]              → plan tree (relational / scalar / sink nodes)
//!     ↓
//! [Emitter]              → instruction graph (+ captured schema)
//!     ↓
//! [Scheduler]            → streaming result rows
//!     ↓                       ↓
//! [Virtual tables] ← [Transaction coordinator + overlay isolation]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use quereus::Database;
//!
//! let db = Database::new().unwrap();
//! db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ()).unwrap();
//! db.exec("INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c')", ()).unwrap();
//!
//! for row in db.eval("SELECT id, name FROM t ORDER BY id", ()).unwrap() {
//!     let row = row.unwrap();
//!     println!("{} {}", row.get(0).unwrap(), row.get(1).unwrap());
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Tagged SQL values, rows, sort keys, collations |
//! | `schema` | Catalog of tables/columns/indexes/functions/views |
//! | `ast` / `parser` | SQL surface → statement trees |
//! | `plan` | Typed plan IR with attribute identity |
//! | `planner` | AST → plan; scope resolution; push-down negotiation |
//! | `exec` | Emitter registry, instruction scheduler, row slots |
//! | `vtab` | Virtual-table contract + the memory reference module |
//! | `isolation` | Per-transaction overlay and the merge iterator |
//! | `txn` | Transaction coordinator (BEGIN/COMMIT/savepoints) |
//! | `events` | Post-commit data-change bus |
//! | `database` | Public handle: exec/eval/prepare |

pub mod ast;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod exec;
pub mod functions;
pub mod isolation;
pub mod parser;
pub mod plan;
pub mod planner;
pub mod schema;
pub mod session;
pub mod txn;
pub mod value;
pub mod vtab;

// Re-export the host-facing surface
pub use config::Config;
pub use database::{Database, Rows, Statement};
pub use error::{QuereusError, Result, SourceLocation, StatusCode};
pub use events::{DataChange, DataChangeBus};
pub use exec::{Interrupt, Params};
pub use schema::{
    CheckConstraint, ColumnSchema, FunctionSchema, IndexSchema, SchemaChange, SchemaManager,
    TableSchema, ViewSchema,
};
pub use value::{Collation, DataType, Row, RowMeta, SortKey, TypeAffinity, Value};
pub use vtab::{
    FilterArg, FilterInfo, IndexConstraint, IndexInfo, RowIter, VirtualTable,
    VirtualTableConnection, VirtualTableModule,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_to_end_smoke() {
        let db = Database::new().expect("open");
        db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", ())
            .expect("create");
        db.exec("INSERT INTO t VALUES (1, 'a')", ()).expect("insert");
        let rows: Vec<Row> = db
            .eval("SELECT * FROM t", ())
            .expect("select")
            .collect::<Result<_>>()
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(1), Some(&Value::Text("a".into())));
    }
}
